//! sched 单元测试
//!
//! 测试协程原语、标签树、统计与调度器行为

mod tag;
