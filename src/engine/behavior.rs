//! User behavior definitions: the plugin surface of the engine.
//!
//! A [`UserBehavior`] bundles the weighted tasks a virtual user runs, the
//! pause between tasks and a factory for the client each user drives. Many
//! virtual users share one behavior through an `Arc`; nothing in it is
//! mutated once it has been registered.

use async_trait::async_trait;
use futures::future::BoxFuture;
use rand::rngs::StdRng;
use rand::Rng;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::user::UserContext;
use crate::error::{Result, SwarmError};
use crate::stats::RequestSample;

pub type UserId = u64;
pub type TaskFuture<'a> = BoxFuture<'a, anyhow::Result<()>>;
pub type TaskFn = Arc<dyn for<'a> Fn(&'a mut UserContext) -> TaskFuture<'a> + Send + Sync>;
pub type ClientFactory = Arc<dyn Fn(UserId) -> Box<dyn Client> + Send + Sync>;

/// Wrap an `async fn(&mut UserContext) -> anyhow::Result<()>` into a [`TaskSpec`].
#[macro_export]
macro_rules! task {
    ($task_fn:ident) => {
        $crate::engine::behavior::TaskSpec::new(stringify!($task_fn), |user| {
            ::std::boxed::Box::pin($task_fn(user))
        })
    };
}

/// Protocol client driven by one virtual user.
///
/// `issue` must yield while waiting on I/O so one slow target does not
/// stall the other users multiplexed on the same runtime thread.
#[async_trait]
pub trait Client: Send {
    async fn issue(&mut self, name: &str) -> RequestSample;
}

#[derive(Clone)]
pub struct TaskSpec {
    name: String,
    weight: u32,
    func: TaskFn,
}

impl TaskSpec {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: for<'a> Fn(&'a mut UserContext) -> TaskFuture<'a> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            weight: 1,
            func: Arc::new(func),
        }
    }

    /// Weight 0 keeps the task registered but never picked.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn call<'a>(&self, user: &'a mut UserContext) -> TaskFuture<'a> {
        (self.func)(user)
    }
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("name", &self.name)
            .field("weight", &self.weight)
            .finish()
    }
}

/// Pause between two tasks of the same user.
#[derive(Clone)]
pub enum WaitTime {
    Constant(Duration),
    /// Uniformly distributed in `[min, max]`.
    Between { min: Duration, max: Duration },
    /// Start one task every period: wait = period - time the task took.
    ConstantPacing(Duration),
    Custom(Arc<dyn Fn(&mut StdRng) -> Duration + Send + Sync>),
}

impl WaitTime {
    pub fn constant(wait: Duration) -> Self {
        WaitTime::Constant(wait)
    }

    pub fn between(min: Duration, max: Duration) -> Self {
        if min <= max {
            WaitTime::Between { min, max }
        } else {
            WaitTime::Between { min: max, max: min }
        }
    }

    pub fn constant_pacing(period: Duration) -> Self {
        WaitTime::ConstantPacing(period)
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&mut StdRng) -> Duration + Send + Sync + 'static,
    {
        WaitTime::Custom(Arc::new(f))
    }

    pub fn next(&self, rng: &mut StdRng, task_elapsed: Duration) -> Duration {
        match self {
            WaitTime::Constant(d) => *d,
            WaitTime::Between { min, max } => {
                if min == max {
                    *min
                } else {
                    rng.gen_range(*min..=*max)
                }
            }
            WaitTime::ConstantPacing(period) => period.saturating_sub(task_elapsed),
            WaitTime::Custom(f) => f(rng),
        }
    }
}

impl Default for WaitTime {
    fn default() -> Self {
        WaitTime::Constant(Duration::ZERO)
    }
}

impl fmt::Debug for WaitTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitTime::Constant(d) => write!(f, "Constant({:?})", d),
            WaitTime::Between { min, max } => write!(f, "Between({:?}..={:?})", min, max),
            WaitTime::ConstantPacing(d) => write!(f, "ConstantPacing({:?})", d),
            WaitTime::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// How a user walks its task list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scheduling {
    /// Pick with probability proportional to weight.
    #[default]
    Weighted,
    /// Cycle in declaration order, each task repeated `weight` times.
    Sequential,
}

pub struct UserBehavior {
    name: String,
    weight: u32,
    tasks: Vec<TaskSpec>,
    wait_time: WaitTime,
    scheduling: Scheduling,
    client_factory: ClientFactory,
    on_start: Option<TaskSpec>,
    on_stop: Option<TaskSpec>,
}

impl UserBehavior {
    pub fn new<F, C>(name: impl Into<String>, client_factory: F) -> Self
    where
        F: Fn(UserId) -> C + Send + Sync + 'static,
        C: Client + 'static,
    {
        Self {
            name: name.into(),
            weight: 1,
            tasks: Vec::new(),
            wait_time: WaitTime::default(),
            scheduling: Scheduling::default(),
            client_factory: Arc::new(move |id| Box::new(client_factory(id)) as Box<dyn Client>),
            on_start: None,
            on_stop: None,
        }
    }

    pub fn register_task(mut self, task: TaskSpec) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn set_wait_time(mut self, wait_time: WaitTime) -> Self {
        self.wait_time = wait_time;
        self
    }

    pub fn set_scheduling(mut self, scheduling: Scheduling) -> Self {
        self.scheduling = scheduling;
        self
    }

    /// Relative share of spawned users that run this behavior.
    pub fn set_weight(mut self, weight: u32) -> Result<Self> {
        if weight == 0 {
            return Err(SwarmError::InvalidWeight {
                name: self.name,
                weight,
            });
        }
        self.weight = weight;
        Ok(self)
    }

    pub fn on_start(mut self, task: TaskSpec) -> Self {
        self.on_start = Some(task);
        self
    }

    pub fn on_stop(mut self, task: TaskSpec) -> Self {
        self.on_stop = Some(task);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(SwarmError::InvalidBehavior {
                name: self.name.clone(),
                reason: "no tasks registered".to_string(),
            });
        }
        if self.tasks.iter().all(|t| t.weight() == 0) {
            return Err(SwarmError::InvalidBehavior {
                name: self.name.clone(),
                reason: "every task has weight 0".to_string(),
            });
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn tasks(&self) -> &[TaskSpec] {
        &self.tasks
    }

    pub fn wait_time(&self) -> &WaitTime {
        &self.wait_time
    }

    pub fn scheduling(&self) -> Scheduling {
        self.scheduling
    }

    pub fn start_task(&self) -> Option<&TaskSpec> {
        self.on_start.as_ref()
    }

    pub fn stop_task(&self) -> Option<&TaskSpec> {
        self.on_stop.as_ref()
    }

    pub fn new_client(&self, id: UserId) -> Box<dyn Client> {
        (self.client_factory)(id)
    }
}

impl fmt::Debug for UserBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserBehavior")
            .field("name", &self.name)
            .field("weight", &self.weight)
            .field("tasks", &self.tasks)
            .field("wait_time", &self.wait_time)
            .field("scheduling", &self.scheduling)
            .finish()
    }
}

/// Name -> behavior map resolved once at startup.
#[derive(Default)]
pub struct BehaviorRegistry {
    behaviors: BTreeMap<String, Arc<UserBehavior>>,
}

impl BehaviorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, behavior: UserBehavior) -> Result<Arc<UserBehavior>> {
        behavior.validate()?;
        let behavior = Arc::new(behavior);
        if self
            .behaviors
            .insert(behavior.name().to_string(), behavior.clone())
            .is_some()
        {
            tracing::warn!(behavior = behavior.name(), "behavior re-registered, replacing previous definition");
        }
        Ok(behavior)
    }

    pub fn get(&self, name: &str) -> Result<Arc<UserBehavior>> {
        self.behaviors
            .get(name)
            .cloned()
            .ok_or_else(|| SwarmError::UnknownBehavior(name.to_string()))
    }

    /// Resolve a selection of names; an empty selection means every behavior.
    pub fn select(&self, names: &[&str]) -> Result<Vec<Arc<UserBehavior>>> {
        if names.is_empty() {
            return Ok(self.behaviors.values().cloned().collect());
        }
        names.iter().map(|n| self.get(n)).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.behaviors.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.behaviors.is_empty()
    }
}
