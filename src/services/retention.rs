//! Allowed retention periods per usergroup.
//!
//! Each group carries a list of permitted upload ages in hours (0 means
//! permanent), and a higher-ranked group always sees the union of its own
//! list and every lower group's list. A group's default age is the first
//! element of its own list or, when that list is empty, the nearest lower
//! group's default.

use crate::config::Config;
use crate::db::models::perms;

#[derive(Debug, Clone)]
pub struct Retention {
    /// Ages available to anonymous uploaders.
    anonymous: Vec<f64>,
    /// Ascending ladder of (rank, ages).
    tiers: Vec<(i64, Vec<f64>)>,
}

impl Retention {
    pub fn from_config(config: &Config) -> Self {
        Self {
            anonymous: config.retention_anonymous.clone(),
            tiers: vec![
                (perms::USER, config.retention_user.clone()),
                (perms::MODERATOR, config.retention_moderator.clone()),
                (perms::ADMIN, config.retention_admin.clone()),
                (perms::SUPERADMIN, config.retention_superadmin.clone()),
            ],
        }
    }

    /// The deduplicated, ascending union of ages visible to a caller.
    /// `rank` is `None` for anonymous uploaders.
    pub fn periods_for(&self, rank: Option<i64>) -> Vec<f64> {
        let mut ages = self.anonymous.clone();
        if let Some(rank) = rank {
            for (tier_rank, tier_ages) in &self.tiers {
                if *tier_rank <= rank {
                    ages.extend_from_slice(tier_ages);
                }
            }
        }
        ages.sort_by(|a, b| a.partial_cmp(b).expect("retention ages are finite"));
        ages.dedup();
        ages
    }

    /// The age applied when the uploader does not ask for one.
    pub fn default_for(&self, rank: Option<i64>) -> Option<f64> {
        let rank = match rank {
            None => return self.anonymous.first().copied(),
            Some(rank) => rank,
        };

        // Walk the ladder downwards from the caller's own group; the first
        // non-empty list supplies the default. Anonymous is the floor.
        for (tier_rank, tier_ages) in self.tiers.iter().rev() {
            if *tier_rank <= rank {
                if let Some(first) = tier_ages.first() {
                    return Some(*first);
                }
            }
        }
        self.anonymous.first().copied()
    }

    /// Whether the caller may request this exact age.
    pub fn validate(&self, rank: Option<i64>, age: f64) -> bool {
        self.periods_for(rank).contains(&age)
    }

    /// Temporary uploads are in play when any group can pick a nonzero age.
    pub fn enabled(&self) -> bool {
        self.anonymous.iter().any(|a| *a > 0.0)
            || self.tiers.iter().any(|(_, ages)| ages.iter().any(|a| *a > 0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retention() -> Retention {
        Retention {
            anonymous: vec![24.0],
            tiers: vec![
                (perms::USER, vec![0.0, 24.0, 168.0]),
                (perms::MODERATOR, vec![720.0]),
                (perms::ADMIN, vec![]),
                (perms::SUPERADMIN, vec![8760.0]),
            ],
        }
    }

    #[test]
    fn higher_groups_inherit_lower_periods() {
        let r = retention();
        assert_eq!(r.periods_for(None), vec![24.0]);
        assert_eq!(r.periods_for(Some(perms::USER)), vec![0.0, 24.0, 168.0]);
        assert_eq!(
            r.periods_for(Some(perms::MODERATOR)),
            vec![0.0, 24.0, 168.0, 720.0]
        );
        // Admin adds nothing of its own but keeps everything below.
        assert_eq!(
            r.periods_for(Some(perms::ADMIN)),
            vec![0.0, 24.0, 168.0, 720.0]
        );
        assert_eq!(
            r.periods_for(Some(perms::SUPERADMIN)),
            vec![0.0, 24.0, 168.0, 720.0, 8760.0]
        );
    }

    #[test]
    fn default_falls_back_to_nearest_lower_group() {
        let r = retention();
        assert_eq!(r.default_for(None), Some(24.0));
        assert_eq!(r.default_for(Some(perms::USER)), Some(0.0));
        assert_eq!(r.default_for(Some(perms::MODERATOR)), Some(720.0));
        // Admin's own list is empty, so it uses moderator's default.
        assert_eq!(r.default_for(Some(perms::ADMIN)), Some(720.0));
        assert_eq!(r.default_for(Some(perms::SUPERADMIN)), Some(8760.0));
    }

    #[test]
    fn validation_is_exact_membership() {
        let r = retention();
        assert!(r.validate(Some(perms::USER), 168.0));
        assert!(!r.validate(Some(perms::USER), 720.0));
        assert!(r.validate(Some(perms::MODERATOR), 720.0));
        assert!(!r.validate(None, 0.0));
    }

    #[test]
    fn enabled_requires_a_nonzero_age_somewhere() {
        let disabled = Retention {
            anonymous: vec![0.0],
            tiers: vec![(perms::USER, vec![0.0])],
        };
        assert!(!disabled.enabled());
        assert!(retention().enabled());
    }
}
