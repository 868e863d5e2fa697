use crate::event::{Event, EventHandler};
use crate::ui;
use color_eyre::Result;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use crossterm::terminal::{
  disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use ratatui::prelude::*;
use std::io::stdout;
use std::time::Duration;
use tasksync::cache::{CacheView, MutationActivity, TaskCache, TaskSubscription};
use tasksync::task::{Task, TaskDraft};
use tokio::sync::watch;

/// Input mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
  Normal,
  /// Typing the value of a new task
  Adding,
}

/// Main application state
pub struct App {
  cache: TaskCache,
  tasks: TaskSubscription,
  activity: watch::Receiver<MutationActivity>,
  selected: usize,
  mode: Mode,
  input: String,
  /// Last local error (e.g. a task that vanished before it could be edited)
  message: Option<String>,
  should_quit: bool,
}

impl App {
  pub fn new(cache: TaskCache) -> Self {
    let tasks = cache.subscribe();
    let activity = cache.subscribe_mutations();
    Self {
      cache,
      tasks,
      activity,
      selected: 0,
      mode: Mode::Normal,
      input: String::new(),
      message: None,
      should_quit: false,
    }
  }

  pub async fn run(&mut self) -> Result<()> {
    // Setup terminal
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;

    let mut events = EventHandler::new(Duration::from_millis(100));

    // Main loop
    while !self.should_quit {
      terminal.draw(|frame| ui::draw(frame, self))?;

      match events.next().await {
        Some(Event::Key(key)) => self.handle_key(key),
        Some(Event::Tick) => self.tick(),
        None => break,
      }
    }

    // Cleanup terminal
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    Ok(())
  }

  pub fn view(&self) -> CacheView {
    self.tasks.current()
  }

  pub fn activity(&self) -> MutationActivity {
    self.activity.borrow().clone()
  }

  pub fn selected(&self) -> usize {
    self.selected
  }

  pub fn mode(&self) -> Mode {
    self.mode
  }

  pub fn input(&self) -> &str {
    &self.input
  }

  pub fn message(&self) -> Option<&str> {
    self.message.as_deref()
  }

  pub fn is_placeholder(&self, task: &Task) -> bool {
    self.cache.store().is_placeholder(task.id)
  }

  fn tick(&mut self) {
    if self.tasks.poll() {
      let len = self.tasks.current().tasks().len();
      self.selected = self.selected.min(len.saturating_sub(1));
    }
  }

  fn handle_key(&mut self, key: KeyEvent) {
    match self.mode {
      Mode::Normal => self.handle_normal_mode_key(key),
      Mode::Adding => self.handle_adding_mode_key(key),
    }
  }

  fn handle_normal_mode_key(&mut self, key: KeyEvent) {
    match key.code {
      KeyCode::Char('q') => self.should_quit = true,
      KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
        self.should_quit = true;
      }

      // Navigation
      KeyCode::Up | KeyCode::Char('k') => self.move_selection(-1),
      KeyCode::Down | KeyCode::Char('j') => self.move_selection(1),

      // Mutations
      KeyCode::Char('a') => {
        self.mode = Mode::Adding;
        self.input.clear();
      }
      KeyCode::Char(' ') | KeyCode::Enter => self.toggle_selected(),
      KeyCode::Char('d') => self.delete_selected(),
      KeyCode::Char('r') => self.tasks.refetch(),

      _ => {}
    }
  }

  fn handle_adding_mode_key(&mut self, key: KeyEvent) {
    match key.code {
      KeyCode::Esc => {
        self.mode = Mode::Normal;
        self.input.clear();
      }
      KeyCode::Enter => {
        let value = self.input.trim();
        let draft = if value.is_empty() {
          TaskDraft::new()
        } else {
          TaskDraft::new().value(value)
        };
        self.report(self.cache.add(draft).map(drop));
        self.selected = 0;
        self.mode = Mode::Normal;
        self.input.clear();
      }
      KeyCode::Backspace => {
        self.input.pop();
      }
      KeyCode::Char(c) => self.input.push(c),
      _ => {}
    }
  }

  fn move_selection(&mut self, delta: isize) {
    let len = self.tasks.current().tasks().len();
    if len == 0 {
      self.selected = 0;
      return;
    }
    self.selected = self
      .selected
      .saturating_add_signed(delta)
      .min(len - 1);
  }

  /// The selected task, unless a mutation on it is still in flight.
  fn selected_task(&mut self) -> Option<Task> {
    let task = self.tasks.current().tasks().get(self.selected).cloned()?;
    if self.activity.borrow().is_target_in_flight(task.id) || self.is_placeholder(&task) {
      self.message = Some(format!("task {} is still syncing", task.id));
      return None;
    }
    Some(task)
  }

  fn toggle_selected(&mut self) {
    if let Some(task) = self.selected_task() {
      // Pass both fields so nothing falls back to update defaults
      let draft = TaskDraft::from_task(&task).completed(!task.completed);
      self.report(self.cache.update(task.id, draft).map(drop));
    }
  }

  fn delete_selected(&mut self) {
    if let Some(task) = self.selected_task() {
      self.report(self.cache.delete(task.id).map(drop));
    }
  }

  fn report(&mut self, result: Result<(), tasksync::cache::CacheError>) {
    self.message = result.err().map(|e| e.to_string());
  }
}
