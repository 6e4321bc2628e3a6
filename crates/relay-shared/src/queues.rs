//! Queue naming conventions.
//!
//! Every domain owns a primary command queue and a default reply queue;
//! reply/process queues may also be freely named per caller.

/// The primary command queue for a domain: `<domain>__commands`.
pub fn command_queue(domain: &str) -> String {
    format!("{domain}__commands")
}

/// The default reply queue for a domain: `<domain>__replies`.
pub fn reply_queue(domain: &str) -> String {
    format!("{domain}__replies")
}
