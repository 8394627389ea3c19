pub mod calibration;
pub mod edge;
pub mod fair_odds;

pub use calibration::{Calibrated, CalibrationCache, CalibrationTable};
pub use edge::{compute_clv, compute_edge, compute_ev, detect_sharpness, rank_candidates};
pub use fair_odds::compute_fair_odds;
