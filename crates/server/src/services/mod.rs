pub mod access;
pub mod aggregation;
pub mod filters;
pub mod storage;
pub mod validation;
