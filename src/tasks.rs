use core::fmt;
use std::{
    thread::{self, JoinHandle},
    time::Duration,
};

use bma_ts::{Monotonic, Timestamp};
use serde::{Serialize, Serializer};

use crate::{Error, Result};

/// A thread builder object, similar to [`thread::Builder`] but producing named [`Task`]
/// handles suitable for the [`crate::supervisor::Supervisor`]
#[derive(Default, Clone)]
pub struct Builder {
    pub(crate) name: Option<String>,
    stack_size: Option<usize>,
    blocking: bool,
}

macro_rules! impl_builder_from {
    ($t: ty) => {
        impl From<$t> for Builder {
            fn from(s: $t) -> Self {
                Builder::new().name(s)
            }
        }
    };
}

impl_builder_from!(&str);
impl_builder_from!(String);

impl Builder {
    /// Creates a new thread builder
    pub fn new() -> Self {
        Self::default()
    }
    /// The task name SHOULD be 15 characters or less to set a proper thread name
    pub fn name<N: fmt::Display>(mut self, name: N) -> Self {
        self.name = Some(name.to_string());
        self
    }
    /// Overrides the default stack size
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }
    /// A hint for task supervisors that the task blocks the thread (e.g. listens to a socket
    /// or has got a big interval in the main loop, does not return any useful result and
    /// should not be joined)
    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }
    /// Spawns a task
    pub fn spawn<F, T>(self, f: F) -> Result<Task<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let mut builder = thread::Builder::new();
        if let Some(ref name) = self.name {
            if name.len() > 15 {
                return Err(Error::invalid_data(format!(
                    "Thread name '{}' is too long (max 15 characters)",
                    name
                )));
            }
            builder = builder.name(name.clone());
        }
        if let Some(stack_size) = self.stack_size {
            builder = builder.stack_size(stack_size);
        }
        let handle = builder.spawn(f)?;
        Ok(Task {
            name: self.name.unwrap_or_default(),
            handle,
            blocking: self.blocking,
            info: <_>::default(),
        })
    }
}

#[derive(Serialize, Default)]
struct TaskInfo {
    started: Timestamp,
    started_mt: Monotonic,
}

/// An extended task object, returned by [`Builder::spawn()`]
///
/// Can be converted into a standard [`JoinHandle`].
#[derive(Serialize)]
pub struct Task<T> {
    name: String,
    #[serde(
        rename(serialize = "active"),
        serialize_with = "serialize_join_handle_active"
    )]
    handle: JoinHandle<T>,
    blocking: bool,
    info: TaskInfo,
}

impl<T> Task<T> {
    /// Returns the task name
    pub fn name(&self) -> &str {
        &self.name
    }
    /// Returns the task handle
    pub fn handle(&self) -> &JoinHandle<T> {
        &self.handle
    }
    /// Returns true if the task is finished
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
    /// Joins the task
    pub fn join(self) -> thread::Result<T> {
        self.handle.join()
    }
    /// Converts the task into a standard [`JoinHandle`]
    pub fn into_join_handle(self) -> JoinHandle<T> {
        self.into()
    }
    /// Returns duration since the task was started
    pub fn elapsed(&self) -> Duration {
        self.info.started_mt.elapsed()
    }
    /// Returns true if the task is blocking
    pub fn is_blocking(&self) -> bool {
        self.blocking
    }
}

impl<T> From<Task<T>> for JoinHandle<T> {
    fn from(task: Task<T>) -> Self {
        task.handle
    }
}

fn serialize_join_handle_active<T, S>(
    handle: &JoinHandle<T>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_bool(!handle.is_finished())
}
