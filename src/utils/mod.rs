pub mod logging;
pub mod politeness;
