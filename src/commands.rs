//! One-shot commands that run a single cache operation and print the result.

use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use tasksync::cache::{MutationState, TaskCache};
use tasksync::task::{Task, TaskDraft, TaskId};

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
  /// Interactive task list (default)
  Tui,
  /// Print all tasks, newest first
  List,
  /// Add a task (value defaults to "New Task")
  Add {
    value: Option<String>,
    #[arg(long)]
    completed: bool,
  },
  /// Update a task; omitted fields follow the configured update defaults
  Update {
    id: TaskId,
    #[arg(long)]
    value: Option<String>,
    #[arg(long)]
    completed: Option<bool>,
  },
  /// Flip a task's completed flag, keeping its value
  Toggle { id: TaskId },
  /// Delete a task
  Delete { id: TaskId },
}

impl Command {
  pub fn is_interactive(&self) -> bool {
    matches!(self, Command::Tui)
  }
}

/// Run a non-interactive command against the cache.
pub async fn run(command: Command, cache: &TaskCache) -> Result<()> {
  let loaded = cache
    .load()
    .await
    .map_err(|e| eyre!("Failed to load tasks: {}", e))?;

  let handle = match command {
    Command::Tui | Command::List => {
      for task in loaded.data.iter() {
        println!("{}", format_task(task));
      }
      return Ok(());
    }
    Command::Add { value, completed } => cache.add(TaskDraft {
      value,
      completed: Some(completed),
    })?,
    Command::Update {
      id,
      value,
      completed,
    } => cache.update(id, TaskDraft { value, completed })?,
    Command::Toggle { id } => {
      let task = cache
        .view()
        .find(id)
        .cloned()
        .ok_or_else(|| eyre!("No task with id {}", id))?;
      cache.update(id, TaskDraft::from_task(&task).completed(!task.completed))?
    }
    Command::Delete { id } => cache.delete(id)?,
  };

  let kind = handle.kind();
  let target = handle.target();
  match handle.settled().await {
    MutationState::Reconciled(Some(task)) => println!("{}", format_task(&task)),
    MutationState::Reconciled(None) => println!("deleted {}", target),
    MutationState::RolledBack(error) => return Err(eyre!("{} failed: {}", kind, error)),
    state => return Err(eyre!("{} did not settle: {:?}", kind, state)),
  }
  Ok(())
}

/// One line per task: `[x]     12  buy milk`
pub fn format_task(task: &Task) -> String {
  let mark = if task.completed { "[x]" } else { "[ ]" };
  format!("{} {:>6}  {}", mark, task.id, task.value)
}
