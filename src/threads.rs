//! Thread selection helpers over the target's thread list.

use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;

use crate::error::{MapError, TargetResultExt};
use crate::target::{Target, ThreadInfo};

/// The thread with the earliest start time, taken to be the process's main thread.
pub fn main_thread(target: &dyn Target) -> Result<Option<ThreadInfo>, MapError> {
    let threads = target.threads().in_pid(target.pid())?;
    Ok(threads.into_iter().min_by_key(|t| t.start_time))
}

/// The thread that has spent the least time executing.
pub fn least_executed(target: &dyn Target) -> Result<Option<ThreadInfo>, MapError> {
    let threads = target.threads().in_pid(target.pid())?;
    Ok(threads.into_iter().min_by_key(|t| t.exec_time))
}

pub fn thread_by_id(target: &dyn Target, id: u32) -> Result<Option<ThreadInfo>, MapError> {
    let threads = target.threads().in_pid(target.pid())?;
    Ok(threads.into_iter().find(|t| t.id == id))
}

/// Any one of the target's threads, picked from the per-process random hasher seed.
pub fn random_thread(target: &dyn Target) -> Result<Option<ThreadInfo>, MapError> {
    let threads = target.threads().in_pid(target.pid())?;
    if threads.is_empty() {
        return Ok(None);
    }
    let pick = RandomState::new().hash_one(threads.len()) as usize % threads.len();
    Ok(threads.into_iter().nth(pick))
}
