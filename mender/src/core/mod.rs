//! Pure, deterministic logic: budgets, the reply grammar, sandbox path rules,
//! outcome types, and version arithmetic. No I/O lives here.

pub mod budget;
pub mod outcome;
pub mod path;
pub mod protocol;
pub mod version;
