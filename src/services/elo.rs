use crate::config::AppConfig;
use crate::models::{ConferenceTier, UNRANKED};

/// Rating transfer computed for one game. `expected_home` is the win
/// probability implied by the pre-game ratings, after the home-field
/// adjustment.
#[derive(Debug, Clone, Copy)]
pub struct RatingUpdate {
    pub home_delta: f64,
    pub away_delta: f64,
    pub expected_home: f64,
}

/// Pure modified-Elo engine. Never touches storage; callers validate inputs.
pub struct EloEngine {
    k_factor: f64,
    home_field_advantage: f64,
    mov_cap: f64,
}

impl EloEngine {
    pub fn new() -> Self {
        Self::from_config(&AppConfig::default())
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            k_factor: config.k_factor,
            home_field_advantage: config.home_field_advantage,
            mov_cap: config.mov_cap,
        }
    }

    /// Expected score of side A against side B.
    pub fn expected_score(rating_a: f64, rating_b: f64) -> f64 {
        1.0 / (1.0 + 10f64.powf((rating_b - rating_a) / 400.0))
    }

    /// Home win probability with the home-field bump applied (unless neutral).
    /// Used by both rating updates and predictions so the two never drift.
    pub fn home_win_probability(
        &self,
        home_rating: f64,
        away_rating: f64,
        is_neutral_site: bool,
    ) -> f64 {
        let bump = if is_neutral_site {
            0.0
        } else {
            self.home_field_advantage
        };
        Self::expected_score(home_rating + bump, away_rating)
    }

    /// Rating deltas for a finished game.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &self,
        home_rating: f64,
        away_rating: f64,
        home_score: i64,
        away_score: i64,
        home_tier: ConferenceTier,
        away_tier: ConferenceTier,
        is_neutral_site: bool,
    ) -> RatingUpdate {
        let expected_home = self.home_win_probability(home_rating, away_rating, is_neutral_site);

        let actual_home = match home_score.cmp(&away_score) {
            std::cmp::Ordering::Greater => 1.0,
            std::cmp::Ordering::Equal => 0.5,
            std::cmp::Ordering::Less => 0.0,
        };

        let margin = (home_score - away_score).abs() as f64;
        let mov_multiplier = if margin == 0.0 {
            1.0
        } else {
            (margin + 1.0).ln().min(self.mov_cap)
        };

        let conference_multiplier =
            Self::conference_multiplier(home_tier, away_tier, home_score, away_score);

        let home_delta =
            self.k_factor * (actual_home - expected_home) * mov_multiplier * conference_multiplier;

        RatingUpdate {
            home_delta,
            away_delta: -home_delta,
            expected_home,
        }
    }

    /// Cross-tier results transfer less (favorite holds serve) or more (upset)
    /// rating. Ties and same-tier games scale by 1.0.
    fn conference_multiplier(
        home_tier: ConferenceTier,
        away_tier: ConferenceTier,
        home_score: i64,
        away_score: i64,
    ) -> f64 {
        use ConferenceTier::*;

        let (winner, loser) = match home_score.cmp(&away_score) {
            std::cmp::Ordering::Greater => (home_tier, away_tier),
            std::cmp::Ordering::Less => (away_tier, home_tier),
            std::cmp::Ordering::Equal => return 1.0,
        };

        match (winner, loser) {
            (P5, G5) => 0.9,
            (G5, P5) => 1.1,
            (P5, Fcs) | (G5, Fcs) => 0.5,
            (Fcs, P5) | (Fcs, G5) => 2.0,
            _ => 1.0,
        }
    }
}

impl Default for EloEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Season starting rating from preseason inputs. Sentinel (999) ranks earn no
/// bonus.
pub fn preseason_rating(
    tier: ConferenceTier,
    recruiting_rank: i64,
    transfer_rank: i64,
    returning_production: f64,
) -> f64 {
    let base = if tier.is_fcs() { 1300.0 } else { 1500.0 };

    let recruiting_bonus = if recruiting_rank == UNRANKED {
        0.0
    } else if recruiting_rank <= 5 {
        200.0
    } else if recruiting_rank <= 10 {
        150.0
    } else if recruiting_rank <= 25 {
        100.0
    } else if recruiting_rank <= 50 {
        50.0
    } else if recruiting_rank <= 75 {
        25.0
    } else {
        0.0
    };

    let transfer_bonus = if transfer_rank == UNRANKED {
        0.0
    } else if transfer_rank <= 5 {
        100.0
    } else if transfer_rank <= 10 {
        75.0
    } else if transfer_rank <= 25 {
        50.0
    } else if transfer_rank <= 50 {
        25.0
    } else {
        0.0
    };

    let production_bonus = if returning_production >= 0.80 {
        40.0
    } else if returning_production >= 0.60 {
        25.0
    } else if returning_production >= 0.40 {
        10.0
    } else {
        0.0
    };

    base + recruiting_bonus + transfer_bonus + production_bonus
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConferenceTier::*;

    const EPS: f64 = 1e-9;

    #[test]
    fn preseason_combines_all_bonuses() {
        // P5, recruiting #3 (+200), transfer #12 (+50), production 0.72 (+25)
        assert_eq!(preseason_rating(P5, 3, 12, 0.72), 1775.0);
    }

    #[test]
    fn preseason_bases_and_sentinels() {
        assert_eq!(preseason_rating(G5, UNRANKED, UNRANKED, 0.0), 1500.0);
        assert_eq!(preseason_rating(Fcs, UNRANKED, UNRANKED, 0.0), 1300.0);
        // Sentinel earns nothing even though 999 falls outside every bracket anyway
        assert_eq!(preseason_rating(P5, UNRANKED, UNRANKED, 0.39), 1500.0);
    }

    #[test]
    fn preseason_bracket_edges() {
        assert_eq!(preseason_rating(P5, 5, 999, 0.0), 1700.0);
        assert_eq!(preseason_rating(P5, 6, 999, 0.0), 1650.0);
        assert_eq!(preseason_rating(P5, 75, 999, 0.0), 1525.0);
        assert_eq!(preseason_rating(P5, 76, 999, 0.0), 1500.0);
        assert_eq!(preseason_rating(P5, 999, 50, 0.0), 1525.0);
        assert_eq!(preseason_rating(P5, 999, 51, 0.0), 1500.0);
        assert_eq!(preseason_rating(P5, 999, 999, 0.80), 1540.0);
        assert_eq!(preseason_rating(P5, 999, 999, 0.40), 1510.0);
    }

    #[test]
    fn standard_game_matches_closed_form() {
        // Home 1600 beats away 1500 by 28-21, not neutral.
        let engine = EloEngine::new();
        let update = engine.update(1600.0, 1500.0, 28, 21, P5, P5, false);

        let expected = 1.0 / (1.0 + 10f64.powf((1500.0 - 1665.0) / 400.0));
        assert!((update.expected_home - expected).abs() < EPS);

        let want = 32.0 * (1.0 - expected) * 8f64.ln();
        assert!((update.home_delta - want).abs() < EPS);
        assert!((update.home_delta + update.away_delta).abs() < EPS);
        assert!(update.home_delta > 0.0);
    }

    #[test]
    fn upset_applies_conference_multiplier() {
        // G5 away 1450 beats P5 home 1700 by 24-21.
        let engine = EloEngine::new();
        let update = engine.update(1700.0, 1450.0, 21, 24, P5, G5, false);

        let expected = 1.0 / (1.0 + 10f64.powf((1450.0 - 1765.0) / 400.0));
        let want = 32.0 * (0.0 - expected) * 4f64.ln() * 1.1;
        assert!((update.home_delta - want).abs() < EPS);
        assert!(update.home_delta < -30.0);
        assert!((update.away_delta + update.home_delta).abs() < EPS);
    }

    #[test]
    fn favored_p5_win_over_g5_is_dampened() {
        let engine = EloEngine::new();
        let cross = engine.update(1600.0, 1500.0, 35, 10, P5, G5, false);
        let same = engine.update(1600.0, 1500.0, 35, 10, P5, P5, false);
        assert!((cross.home_delta - same.home_delta * 0.9).abs() < EPS);
    }

    #[test]
    fn fcs_multipliers() {
        let engine = EloEngine::new();
        let beat_fcs = engine.update(1600.0, 1300.0, 56, 7, P5, Fcs, false);
        let same = engine.update(1600.0, 1300.0, 56, 7, P5, P5, false);
        assert!((beat_fcs.home_delta - same.home_delta * 0.5).abs() < EPS);

        let fcs_upset = engine.update(1600.0, 1300.0, 7, 10, P5, Fcs, false);
        let same_upset = engine.update(1600.0, 1300.0, 7, 10, P5, P5, false);
        assert!((fcs_upset.home_delta - same_upset.home_delta * 2.0).abs() < EPS);
    }

    #[test]
    fn tie_uses_unit_mov_and_half_actual() {
        let engine = EloEngine::new();
        let update = engine.update(1600.0, 1600.0, 21, 21, P5, P5, false);
        let expected = 1.0 / (1.0 + 10f64.powf((1600.0 - 1665.0) / 400.0));
        let want = 32.0 * (0.5 - expected);
        assert!((update.home_delta - want).abs() < EPS);
        // Favored home side drops a little on a tie.
        assert!(update.home_delta < 0.0 && update.home_delta > -5.0);
    }

    #[test]
    fn blowout_saturates_mov_cap() {
        let engine = EloEngine::new();
        // ln(12) is just under the 2.5 cap; anything past ~11.18 points saturates.
        let eleven = engine.update(1500.0, 1500.0, 28, 17, P5, P5, true);
        let fifty = engine.update(1500.0, 1500.0, 66, 16, P5, P5, true);
        let base = 32.0 * (1.0 - 0.5);
        assert!((eleven.home_delta - base * 12f64.ln().min(2.5)).abs() < EPS);
        assert!((fifty.home_delta - base * 2.5).abs() < EPS);
        assert!(fifty.home_delta >= eleven.home_delta);
    }

    #[test]
    fn neutral_site_drops_home_field() {
        let engine = EloEngine::new();
        let neutral = engine.home_win_probability(1500.0, 1500.0, true);
        let home = engine.home_win_probability(1500.0, 1500.0, false);
        assert!((neutral - 0.5).abs() < EPS);
        assert!(home > 0.5);
        let with_bump = EloEngine::expected_score(1565.0, 1500.0);
        assert!((home - with_bump).abs() < EPS);
    }

    #[test]
    fn deltas_are_exactly_zero_sum() {
        let engine = EloEngine::new();
        for (hs, aws) in [(45, 3), (20, 23), (14, 14), (0, 2)] {
            let update = engine.update(1712.5, 1488.25, hs, aws, P5, G5, false);
            assert!((update.home_delta + update.away_delta).abs() < EPS);
        }
    }
}
