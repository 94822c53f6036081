//! Agent tasks: stateless job-level subroutines.
//!
//! An agent has no recipe of its own — it exists to be invoked with a job
//! by whichever task needs the step, and it answers from the job record
//! alone.

pub mod record;
