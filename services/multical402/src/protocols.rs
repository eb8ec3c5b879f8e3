//! Protocol implementations
//!
//! The meter speaks Kamstrup Meter Protocol (KMP) over its optical eye.

pub mod kmp;
