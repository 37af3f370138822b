pub mod detect;
pub mod estimate;
pub mod run;
pub mod simulate;
