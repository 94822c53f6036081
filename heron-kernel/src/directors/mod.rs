//! Director tasks: application recipes spanning several tasks.
//!
//! A director names every step of its recipe in a state enum and advances
//! one step per incoming reply: validate the previous step's status, store
//! its results, issue the next job. Directors never call anywhere
//! synchronously, and never implement their own timeouts — a clock alarm
//! guards every step that depends on somebody else answering.

pub mod logger;
