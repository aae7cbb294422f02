//! Redis key layout.
//!
//! ```text
//! tq:queues               set of known queue names
//! tq:{queue}:pending      list, LPUSH in / LMOVE RIGHT out
//! tq:{queue}:active       list of tasks being processed
//! tq:{queue}:lease        zset of active tasks scored by lease expiry (unix ms)
//! tq:{queue}:scheduled    zset scored by process-at (unix seconds)
//! tq:{queue}:retry        zset scored by next attempt (unix seconds)
//! tq:{queue}:archived     zset scored by archive time (unix seconds)
//! ```

pub const PREFIX: &str = "tq";

pub fn queues() -> String {
    format!("{PREFIX}:queues")
}

pub fn pending(queue: &str) -> String {
    format!("{PREFIX}:{queue}:pending")
}

pub fn active(queue: &str) -> String {
    format!("{PREFIX}:{queue}:active")
}

pub fn lease(queue: &str) -> String {
    format!("{PREFIX}:{queue}:lease")
}

pub fn scheduled(queue: &str) -> String {
    format!("{PREFIX}:{queue}:scheduled")
}

pub fn retry(queue: &str) -> String {
    format!("{PREFIX}:{queue}:retry")
}

pub fn archived(queue: &str) -> String {
    format!("{PREFIX}:{queue}:archived")
}
