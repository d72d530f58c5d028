pub mod helpers;
pub mod lifecycle;
pub mod run;
