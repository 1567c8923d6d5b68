pub mod discrepancy;
pub mod timestamp;
