use serde::Serialize;
use ulid::Ulid;

use crate::limits::*;
use crate::model::RewardGrant;

use super::Engine;

/// Ascending level thresholds; the level is the highest one not exceeding
/// the current points.
const LEVELS: [(i64, &str); 4] = [
    (0, "Eco Starter"),
    (50, "Bronze Member"),
    (200, "Silver Saver"),
    (500, "Green Hero"),
];

pub fn level_for(points: i64) -> &'static str {
    LEVELS
        .iter()
        .rev()
        .find(|(threshold, _)| points >= *threshold)
        .map(|(_, name)| *name)
        .unwrap_or(LEVELS[0].1)
}

/// Grant policy: floor(hours × 5) points, 0.8 kg carbon per hour.
pub fn compute_grant(duration_hours: f64) -> RewardGrant {
    RewardGrant {
        points_earned: (duration_hours * POINTS_PER_HOUR).floor() as i64,
        carbon_saved: duration_hours * CARBON_KG_PER_HOUR,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RewardView {
    pub user_id: Ulid,
    pub points: i64,
    pub carbon_saved: f64,
    pub level: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaderboardEntry {
    pub user_id: Ulid,
    pub name: String,
    pub picture: Option<String>,
    pub points: i64,
    pub carbon_saved: f64,
    pub level: &'static str,
}

impl Engine {
    /// Apply an already-computed grant to a user's account. Points and carbon
    /// only ever grow; the per-account lock serializes concurrent credits.
    pub(super) async fn apply_credit(&self, user_id: Ulid, grant: RewardGrant) {
        let account = self
            .accounts
            .entry(user_id)
            .or_insert_with(|| {
                std::sync::Arc::new(tokio::sync::RwLock::new(
                    crate::model::RewardAccount::new(user_id),
                ))
            })
            .value()
            .clone();
        let mut acct = account.write().await;
        acct.points += grant.points_earned;
        acct.carbon_saved_kg += grant.carbon_saved;
    }

    pub async fn rewards_of(&self, user_id: Ulid) -> RewardView {
        let Some(account) = self.accounts.get(&user_id).map(|e| e.value().clone()) else {
            return RewardView {
                user_id,
                points: 0,
                carbon_saved: 0.0,
                level: level_for(0),
            };
        };
        let acct = account.read().await;
        RewardView {
            user_id,
            points: acct.points,
            carbon_saved: acct.carbon_saved_kg,
            level: level_for(acct.points),
        }
    }

    /// Ranked by points, ties broken by carbon, then user id so the order is
    /// deterministic. Reads run concurrently with credits and may see a
    /// slightly stale snapshot.
    pub async fn leaderboard(&self, limit: usize) -> Vec<LeaderboardEntry> {
        let accounts: Vec<_> = self
            .accounts
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut entries = Vec::with_capacity(accounts.len());
        for (user_id, account) in accounts {
            let Some(user) = self.user(&user_id) else { continue };
            let acct = account.read().await;
            entries.push(LeaderboardEntry {
                user_id,
                name: user.name,
                picture: user.picture,
                points: acct.points,
                carbon_saved: acct.carbon_saved_kg,
                level: level_for(acct.points),
            });
        }

        entries.sort_by(|a, b| {
            b.points
                .cmp(&a.points)
                .then_with(|| b.carbon_saved.total_cmp(&a.carbon_saved))
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        entries.truncate(limit);
        entries
    }
}

#[cfg(test)]
mod unit {
    use super::*;

    #[test]
    fn grant_policy() {
        assert_eq!(compute_grant(2.0).points_earned, 10);
        assert_eq!(compute_grant(0.5).points_earned, 2);
        assert_eq!(compute_grant(1.5).points_earned, 7);
        let g = compute_grant(2.0);
        assert!((g.carbon_saved - 1.6).abs() < 1e-9);
    }

    #[test]
    fn level_thresholds() {
        assert_eq!(level_for(0), "Eco Starter");
        assert_eq!(level_for(40), "Eco Starter");
        assert_eq!(level_for(50), "Bronze Member");
        assert_eq!(level_for(199), "Bronze Member");
        assert_eq!(level_for(200), "Silver Saver");
        assert_eq!(level_for(500), "Green Hero");
        assert_eq!(level_for(10_000), "Green Hero");
    }
}
