use crate::exec::NodeContext;
use crate::external::ExternalDataLinker;
use anyhow::Result;
use std::any::Any;

/// Lifecycle status shared by tree instances and the tasks they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunStatus {
    #[default]
    Unset,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_running(self) -> bool {
        matches!(self, RunStatus::Running)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }

    pub fn label(self) -> &'static str {
        match self {
            RunStatus::Unset => "unset",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }
}

/// Per-instance storage for a single node. Nodes that keep state across ticks
/// return a filled box from `instantiate`; stateless nodes use `empty`.
pub struct NodeMemory(Option<Box<dyn Any + Send + Sync>>);

impl NodeMemory {
    pub fn empty() -> Self {
        Self(None)
    }

    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Some(Box::new(value)))
    }

    pub fn get<T: Any>(&self) -> Option<&T> {
        self.0.as_ref()?.downcast_ref()
    }

    pub fn get_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.0.as_mut()?.downcast_mut()
    }
}

/// An action node on a leaf state. The engine drives enter/tick/exit; the task
/// reports its status and reads external data only through handles it acquired
/// during `link`.
pub trait TaskNode: Send + Sync {
    fn link(&mut self, _linker: &mut ExternalDataLinker) -> Result<()> {
        Ok(())
    }

    fn instantiate(&self) -> NodeMemory {
        NodeMemory::empty()
    }

    fn enter(&self, _ctx: &mut NodeContext<'_, '_>) -> RunStatus {
        RunStatus::Running
    }

    fn tick(&self, ctx: &mut NodeContext<'_, '_>, dt: f32) -> RunStatus;

    fn exit(&self, _ctx: &mut NodeContext<'_, '_>) {}

    fn state_completed(&self, _ctx: &mut NodeContext<'_, '_>, _status: RunStatus) {}
}

/// A value-producing node ticked every frame while its owner is active.
/// Evaluators never affect run status.
pub trait EvaluatorNode: Send + Sync {
    fn link(&mut self, _linker: &mut ExternalDataLinker) -> Result<()> {
        Ok(())
    }

    fn instantiate(&self) -> NodeMemory {
        NodeMemory::empty()
    }

    fn start(&self, _ctx: &mut NodeContext<'_, '_>) {}

    fn tick(&self, ctx: &mut NodeContext<'_, '_>, dt: f32);

    fn stop(&self, _ctx: &mut NodeContext<'_, '_>) {}
}

/// A boolean guard used by enter conditions and transition rules.
pub trait ConditionNode: Send + Sync {
    fn link(&mut self, _linker: &mut ExternalDataLinker) -> Result<()> {
        Ok(())
    }

    fn test(&self, ctx: &mut NodeContext<'_, '_>) -> bool;
}
