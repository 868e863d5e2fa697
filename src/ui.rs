use crate::app::{App, Mode};
use ratatui::prelude::*;
use ratatui::widgets::{Block, Borders, List, ListItem, ListState, Paragraph};
use tasksync::cache::{CacheView, MutationActivity};

/// Main draw function
pub fn draw(frame: &mut Frame, app: &App) {
  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .constraints([
      Constraint::Min(1),    // Task list
      Constraint::Length(1), // Status bar
    ])
    .split(frame.area());

  let view = app.view();
  draw_task_list(frame, chunks[0], app, &view);
  draw_status_bar(frame, chunks[1], app, &view, &app.activity());
}

fn draw_task_list(frame: &mut Frame, area: Rect, app: &App, view: &CacheView) {
  let title = if view.is_loading() {
    " Tasks (loading...) ".to_string()
  } else if view.is_fetching() {
    format!(" Tasks ({}, refreshing) ", view.tasks().len())
  } else {
    format!(" Tasks ({}) ", view.tasks().len())
  };

  let block = Block::default()
    .title(title)
    .borders(Borders::ALL)
    .border_style(Style::default().fg(Color::Blue));

  if view.tasks().is_empty() {
    let text = match view.error() {
      Some(e) if view.is_absent() => format!("Could not load tasks: {}", e),
      _ if view.is_loading() => String::new(),
      _ => "No tasks. Press 'a' to add one.".to_string(),
    };
    let paragraph = Paragraph::new(text)
      .block(block)
      .style(Style::default().fg(Color::DarkGray));
    frame.render_widget(paragraph, area);
    return;
  }

  let items: Vec<ListItem> = view
    .tasks()
    .iter()
    .map(|task| {
      let (mark, mark_style) = if task.completed {
        ("[x]", Style::default().fg(Color::Green))
      } else {
        ("[ ]", Style::default().fg(Color::White))
      };
      let value_style = if app.is_placeholder(task) {
        Style::default().fg(Color::DarkGray).add_modifier(Modifier::ITALIC)
      } else if task.completed {
        Style::default().add_modifier(Modifier::CROSSED_OUT)
      } else {
        Style::default()
      };
      let line = Line::from(vec![
        Span::styled(mark, mark_style),
        Span::raw(" "),
        Span::styled(task.value.as_str(), value_style),
      ]);
      ListItem::new(line)
    })
    .collect();

  let list = List::new(items)
    .block(block)
    .highlight_style(
      Style::default()
        .bg(Color::DarkGray)
        .add_modifier(Modifier::BOLD),
    )
    .highlight_symbol("> ");

  let mut state = ListState::default();
  state.select(Some(app.selected()));

  frame.render_stateful_widget(list, area, &mut state);
}

fn draw_status_bar(
  frame: &mut Frame,
  area: Rect,
  app: &App,
  view: &CacheView,
  activity: &MutationActivity,
) {
  let (content, style) = match app.mode() {
    Mode::Adding => (
      format!("new task: {}", app.input()),
      Style::default().fg(Color::Yellow),
    ),
    Mode::Normal => {
      if let Some(message) = app.message() {
        (message.to_string(), Style::default().fg(Color::Red))
      } else if let Some(failure) = &activity.last_failure {
        (
          format!(
            " {} of task {} failed: {}",
            failure.kind, failure.target, failure.error
          ),
          Style::default().fg(Color::Red),
        )
      } else if !activity.is_idle() {
        (
          format!(" syncing {} change(s)...", activity.in_flight.len()),
          Style::default().fg(Color::Cyan),
        )
      } else if let (Some(e), false) = (view.error(), view.is_absent()) {
        (
          format!(" offline, showing cached tasks: {}", e),
          Style::default().fg(Color::Yellow),
        )
      } else {
        (
          " a:add  space:toggle  d:delete  r:refresh  j/k:nav  q:quit".to_string(),
          Style::default().fg(Color::DarkGray),
        )
      }
    }
  };

  let paragraph = Paragraph::new(content).style(style);
  frame.render_widget(paragraph, area);
}
