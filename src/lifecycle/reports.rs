use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::db::models::{BetLifecycle, GatingChange, GatingStatus, TimingBucket};
use crate::db::reports::{Breakdown, LifecycleStats, WeeklyReport};
use crate::db::Database;
use crate::error::Result;

/// Running totals over a set of settled bets
#[derive(Debug, Clone, Default)]
struct Tally {
    bets: i64,
    wins: i64,
    losses: i64,
    profit: f64,
    stake: f64,
    clv_sum: f64,
    clv_n: i64,
    ev_sum: f64,
    odds_sum: f64,
}

impl Tally {
    fn add(&mut self, bet: &BetLifecycle) {
        self.bets += 1;
        match bet.result {
            Some(r) if r.is_win() => self.wins += 1,
            Some(r) if r.is_loss() => self.losses += 1,
            _ => {}
        }
        self.profit += bet.profit_loss.unwrap_or(0.0);
        self.stake += bet.stake_units;
        if let Some(clv) = bet.clv_pct {
            self.clv_sum += clv;
            self.clv_n += 1;
        }
        self.ev_sum += bet.ev_pct;
        self.odds_sum += bet.odds;
    }

    fn roi_pct(&self) -> f64 {
        if self.stake > 0.0 {
            self.profit / self.stake * 100.0
        } else {
            0.0
        }
    }

    fn avg_clv(&self) -> Option<f64> {
        (self.clv_n > 0).then(|| self.clv_sum / self.clv_n as f64)
    }

    fn hit_rate(&self) -> f64 {
        let decided = self.wins + self.losses;
        if decided > 0 {
            self.wins as f64 / decided as f64 * 100.0
        } else {
            0.0
        }
    }

    fn mean(&self, sum: f64) -> f64 {
        if self.bets > 0 {
            sum / self.bets as f64
        } else {
            0.0
        }
    }

    fn breakdown(&self) -> Breakdown {
        Breakdown {
            bets: self.bets,
            wins: self.wins,
            profit: self.profit,
            stake: self.stake,
            roi_pct: self.roi_pct(),
            avg_clv: self.avg_clv().unwrap_or(0.0),
        }
    }
}

pub fn rolling_stats(db: &Database, sport: Option<&str>, days: i64, now: DateTime<Utc>) -> Result<LifecycleStats> {
    db.lifecycle_stats(sport, now - Duration::days(days.max(1)))
}

// ── Weekly report ─────────────────────────────────────────────────────────────

/// Monday of the week containing `day`
pub fn week_start_of(day: NaiveDate) -> NaiveDate {
    day - Duration::days(day.weekday().num_days_from_monday() as i64)
}

/// Build a report from the week's settled bets and gating changes.
pub fn build_weekly_report(week_start: NaiveDate, bets: &[BetLifecycle], changes: &[GatingChange]) -> WeeklyReport {
    let week_start = week_start_of(week_start);
    let mut report = WeeklyReport::empty(week_start, week_start + Duration::days(6));

    let mut total = Tally::default();
    let mut by_market: BTreeMap<String, Tally> = BTreeMap::new();
    let mut by_league: BTreeMap<String, Tally> = BTreeMap::new();
    for bet in bets {
        total.add(bet);
        by_market.entry(bet.market_type.clone()).or_default().add(bet);
        by_league.entry(bet.league.clone()).or_default().add(bet);
    }

    report.total_bets = total.bets;
    report.wins = total.wins;
    report.losses = total.losses;
    report.pushes = total.bets - total.wins - total.losses;
    report.hit_rate = total.hit_rate();
    report.profit_units = total.profit;
    report.roi_pct = total.roi_pct();
    report.avg_clv = total.avg_clv().unwrap_or(0.0);
    report.avg_ev = total.mean(total.ev_sum);
    report.avg_odds = total.mean(total.odds_sum);

    report.by_market = by_market.iter().map(|(k, t)| (k.clone(), t.breakdown())).collect();
    report.by_league = by_league.iter().map(|(k, t)| (k.clone(), t.breakdown())).collect();

    report.best_market = report
        .by_market
        .iter()
        .max_by(|a, b| a.1.roi_pct.total_cmp(&b.1.roi_pct))
        .map(|(k, _)| k.clone());
    report.worst_market = report
        .by_market
        .iter()
        .min_by(|a, b| a.1.roi_pct.total_cmp(&b.1.roi_pct))
        .map(|(k, _)| k.clone());
    report.top_league = report
        .by_league
        .iter()
        .max_by(|a, b| a.1.profit.total_cmp(&b.1.profit))
        .map(|(k, _)| k.clone());

    report.promotions = changes
        .iter()
        .filter(|c| c.new_status == GatingStatus::Production)
        .count() as i64;
    report.demotions = changes.len() as i64 - report.promotions;
    report
}

/// Generate and store the report for the week starting on (or containing)
/// `week_start`; the last completed week by default. The report is returned
/// even when the gating-change count or the write fails.
pub fn generate_weekly_report(db: &Database, week_start: Option<NaiveDate>, now: DateTime<Utc>) -> Result<WeeklyReport> {
    let start = week_start_of(week_start.unwrap_or_else(|| now.date_naive() - Duration::days(7)));
    let from = start.and_time(NaiveTime::MIN).and_utc();
    let to = from + Duration::days(7);

    let bets = db.settled_bets(None, Some(from), Some(to))?;
    let changes = match db.gating_changes_between(from, to) {
        Ok(c) => c,
        Err(e) => {
            warn!("Could not read gating changes for week {}: {}", start, e);
            Vec::new()
        }
    };
    let report = build_weekly_report(start, &bets, &changes);

    match db.save_weekly_report(&report, now) {
        Ok(()) => info!(
            "Weekly report {}: {} bets, {:+.2}u, ROI {:.1}%",
            start, report.total_bets, report.profit_units, report.roi_pct
        ),
        Err(e) => warn!("Weekly report {} not persisted: {}", start, e),
    }
    Ok(report)
}

// ── CLV / timing analytics ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClvSummary {
    pub count: i64,
    pub avg_clv: f64,
    pub positive_pct: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClvAnalytics {
    pub overall: ClvSummary,
    pub by_market: BTreeMap<String, ClvSummary>,
    pub by_league: BTreeMap<String, ClvSummary>,
}

fn clv_summary(values: &[f64]) -> ClvSummary {
    if values.is_empty() {
        return ClvSummary::default();
    }
    let n = values.len() as f64;
    ClvSummary {
        count: values.len() as i64,
        avg_clv: values.iter().sum::<f64>() / n,
        positive_pct: values.iter().filter(|v| **v > 0.0).count() as f64 / n * 100.0,
    }
}

/// CLV distribution over settled bets that have a closing line
pub fn clv_analytics(bets: &[BetLifecycle]) -> ClvAnalytics {
    let mut all = Vec::new();
    let mut by_market: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    let mut by_league: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for bet in bets {
        let Some(clv) = bet.clv_pct else { continue };
        all.push(clv);
        by_market.entry(bet.market_type.clone()).or_default().push(clv);
        by_league.entry(bet.league.clone()).or_default().push(clv);
    }
    ClvAnalytics {
        overall: clv_summary(&all),
        by_market: by_market.iter().map(|(k, v)| (k.clone(), clv_summary(v))).collect(),
        by_league: by_league.iter().map(|(k, v)| (k.clone(), clv_summary(v))).collect(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimingStats {
    pub bucket: TimingBucket,
    pub bets: i64,
    pub wins: i64,
    pub roi_pct: f64,
    pub avg_clv: Option<f64>,
    pub avg_ev: f64,
}

/// Results by how long before kickoff the bet was found
pub fn timing_analytics(bets: &[BetLifecycle]) -> Vec<TimingStats> {
    TimingBucket::ALL
        .iter()
        .filter_map(|bucket| {
            let mut tally = Tally::default();
            bets.iter()
                .filter(|b| b.timing_bucket == *bucket)
                .for_each(|b| tally.add(b));
            (tally.bets > 0).then(|| TimingStats {
                bucket: *bucket,
                bets: tally.bets,
                wins: tally.wins,
                roi_pct: tally.roi_pct(),
                avg_clv: tally.avg_clv(),
                avg_ev: tally.mean(tally.ev_sum),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::BetResult;
    use crate::lifecycle::tests::settled_bet;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn week() -> Vec<BetLifecycle> {
        let mut a = settled_bet(1, "football", "epl", "moneyline", 1.0);
        a.clv_pct = Some(2.0);
        let mut b = settled_bet(2, "football", "epl", "totals", -1.5);
        b.clv_pct = Some(-1.0);
        let mut c = settled_bet(3, "football", "laliga", "moneyline", 0.0);
        c.result = Some(BetResult::Push);
        c.timing_bucket = TimingBucket::OverADay;
        vec![a, b, c]
    }

    #[test]
    fn weeks_start_on_monday() {
        // 2026-10-22 is a Thursday
        let thu = NaiveDate::from_ymd_opt(2026, 10, 22).unwrap();
        assert_eq!(week_start_of(thu), NaiveDate::from_ymd_opt(2026, 10, 19).unwrap());
    }

    #[test]
    fn weekly_report_totals_and_rankings() {
        let start = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let promo = GatingChange {
            id: None,
            sport: "football".into(),
            league: "epl".into(),
            market_type: "moneyline".into(),
            old_status: Some(GatingStatus::LearningOnly),
            new_status: GatingStatus::Production,
            reason: "Promoted".into(),
            manual: false,
            changed_at: Utc.with_ymd_and_hms(2026, 10, 20, 0, 0, 0).unwrap(),
        };
        let report = build_weekly_report(start, &week(), &[promo]);
        assert_eq!(report.week_end, NaiveDate::from_ymd_opt(2026, 10, 25).unwrap());
        assert_eq!(report.total_bets, 3);
        assert_eq!((report.wins, report.losses, report.pushes), (1, 1, 1));
        assert_relative_eq!(report.hit_rate, 50.0);
        assert_relative_eq!(report.profit_units, -0.5);
        assert_relative_eq!(report.avg_clv, 0.5);
        assert_eq!(report.best_market.as_deref(), Some("moneyline"));
        assert_eq!(report.worst_market.as_deref(), Some("totals"));
        assert_eq!(report.top_league.as_deref(), Some("laliga"));
        assert_eq!((report.promotions, report.demotions), (1, 0));
        assert_relative_eq!(report.by_market["moneyline"].roi_pct, 50.0);
    }

    #[test]
    fn weekly_report_is_persisted_by_week_start() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 10, 21, 8, 0, 0).unwrap();
        let report = generate_weekly_report(&db, None, now).unwrap();
        assert_eq!(report.week_start, NaiveDate::from_ymd_opt(2026, 10, 12).unwrap());
        generate_weekly_report(&db, None, now).unwrap();
        assert_eq!(db.list_weekly_reports(10).unwrap().len(), 1);
        assert!(db.get_weekly_report(report.week_start).unwrap().is_some());
    }

    #[test]
    fn clv_and_timing_breakdowns() {
        let clv = clv_analytics(&week());
        assert_eq!(clv.overall.count, 2);
        assert_relative_eq!(clv.overall.avg_clv, 0.5);
        assert_relative_eq!(clv.overall.positive_pct, 50.0);
        assert_eq!(clv.by_market["totals"].count, 1);
        assert!(!clv.by_league.contains_key("laliga"));

        let timing = timing_analytics(&week());
        assert_eq!(timing.len(), 2);
        assert_eq!(timing[0].bucket, TimingBucket::OneToThreeHours);
        assert_eq!(timing[0].bets, 2);
        assert_eq!(timing[0].avg_clv, Some(0.5));
        assert_eq!(timing[1].bucket, TimingBucket::OverADay);
        assert_eq!(timing[1].avg_clv, None);
    }
}
