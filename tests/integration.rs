#[path = "integration/cancellation.rs"]
mod cancellation;
#[path = "integration/pipeline.rs"]
mod pipeline;
#[path = "integration/timers.rs"]
mod timers;
