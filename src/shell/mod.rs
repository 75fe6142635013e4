//! Interactive session engine
//!
//! [`Session`] is the line editor and session state for one remote shell.
//! It is a plain state machine: keystrokes and remote output go in, a list
//! of [`Effect`]s comes out, and the [`driver`] carries them out against the
//! terminal and the transport. Results of remote round trips come back in
//! through [`Session::directory_resolved`], [`Session::completion_ready`]
//! and [`Session::transfer_event`].
//!
//! Screen model: while the editor is visible the terminal shows the prompt
//! (or nothing, while a remote command is still running) followed by the
//! buffer, and the renderer knows where the terminal cursor is relative to
//! it. Anything else that gets printed first erases the editor and draws it
//! again afterwards.

pub mod buffer;
pub mod completer;
pub mod cursor;
pub mod dispatch;
pub mod driver;
pub mod history;
pub mod input;
pub mod parser;
pub mod passthrough;
pub mod path;
pub mod prompt;
pub mod width;

use std::path::PathBuf;
use std::time::Duration;

use colored::Colorize;
use tracing::{debug, info, warn};

use self::buffer::{Change, EditBuffer};
use self::completer::{Candidate, CompletionContext, CompletionRequest, Target, DEFAULT_COMMANDS};
use self::cursor::{step_left, step_right, CursorState, Renderer};
use self::dispatch::{Dispatch, DispatchSettings, Location, Refresh};
use self::history::{History, DEFAULT_MAX_ENTRIES};
use self::input::{Key, KeyDecoder};
use self::passthrough::{ExitWatcher, Marker, MarkerScanner, Segment, PROMPT_MARKER_SETUP};
use self::prompt::{PromptRenderer, SystemFlavor};
use crate::config::Config;
use crate::error::TransferError;
use crate::transfer::{Direction, TransferEvent, TransferRequest};
use crate::transport::DirEntry;

const INTERRUPT: u8 = 0x03;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Normal,
    MultiLine,
    /// A full-screen program owns the terminal; keys go out untouched.
    EditorPassthrough,
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub phase: Phase,
    /// Remote working directory, only updated after the remote confirmed it.
    pub working_directory: String,
    pub previous_working_directory: Option<String>,
    pub home: Option<String>,
    pub system_flavor: SystemFlavor,
    /// A forwarded command is still running; the prompt comes back with the
    /// remote command-done marker.
    pub awaiting_prompt: bool,
}

/// A `cd` waiting for remote confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryChange {
    /// Absolute target, as resolved against the cached working directory.
    pub target: String,
    /// The command as typed, forwarded once the target is confirmed.
    pub command: String,
}

/// Work the session hands to its driver, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Bytes for the local terminal.
    Display(Vec<u8>),
    /// Bytes for the remote shell channel.
    Send(Vec<u8>),
    /// Run `cd TARGET && pwd` remotely, then call [`Session::directory_resolved`].
    ResolveDirectory(DirectoryChange),
    /// List a remote directory, then call [`Session::completion_ready`].
    ListDirectory(CompletionRequest),
    StartTransfer(TransferRequest),
    RefreshTree(Refresh),
    HistoryAppend(String),
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub dispatch: DispatchSettings,
    /// Command names offered by completion.
    pub commands: Vec<String>,
    pub prompt_marker: bool,
    pub prompt_setup: String,
    pub history_limit: usize,
    /// Local directory transfer paths are relative to.
    pub local_dir: PathBuf,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            dispatch: DispatchSettings::default(),
            commands: DEFAULT_COMMANDS.iter().map(|s| s.to_string()).collect(),
            prompt_marker: true,
            prompt_setup: PROMPT_MARKER_SETUP.to_string(),
            history_limit: DEFAULT_MAX_ENTRIES,
            local_dir: PathBuf::from("."),
        }
    }
}

impl SessionSettings {
    pub fn from_config(config: &Config, local_dir: PathBuf) -> Self {
        Self {
            dispatch: config.dispatch.clone(),
            commands: config.completion.commands.clone(),
            prompt_marker: config.prompt.marker,
            prompt_setup: config.prompt.setup.clone(),
            history_limit: config.history.max_entries,
            local_dir,
        }
    }
}

pub struct Session {
    state: SessionState,
    settings: SessionSettings,
    prompt: PromptRenderer,
    buffer: EditBuffer,
    cursor: CursorState,
    renderer: Renderer,
    decoder: KeyDecoder,
    scanner: MarkerScanner,
    history: History,
    watcher: Option<ExitWatcher>,
    /// Prompt and buffer are on screen and the renderer tracks them.
    editor_visible: bool,
    /// With the editor hidden, the terminal cursor is at the start of a line.
    at_line_start: bool,
    last_was_cr: bool,
    /// The remote asked for a password: keys go out unechoed until Enter.
    secret_input: bool,
    /// A `cd` is being confirmed; input waits in `held_input`.
    resolving: bool,
    held_input: Vec<u8>,
    completing: Option<CompletionRequest>,
    progress: Option<String>,
    /// The progress line sits right above the prompt.
    progress_shown: bool,
    /// Messages waiting for the next prompt.
    deferred: Vec<String>,
    closed: bool,
    effects: Vec<Effect>,
}

impl Session {
    pub fn new(settings: SessionSettings, prompt: PromptRenderer) -> Self {
        let history = History::new(settings.history_limit);
        Self {
            state: SessionState {
                phase: Phase::Normal,
                working_directory: "~".to_string(),
                previous_working_directory: None,
                home: None,
                system_flavor: prompt.flavor(),
                awaiting_prompt: false,
            },
            settings,
            prompt,
            buffer: EditBuffer::new(),
            cursor: CursorState::default(),
            renderer: Renderer::new(),
            decoder: KeyDecoder::new(),
            scanner: MarkerScanner::new(),
            history,
            watcher: None,
            editor_visible: false,
            at_line_start: true,
            last_was_cr: false,
            secret_input: false,
            resolving: false,
            held_input: Vec::new(),
            completing: None,
            progress: None,
            progress_shown: false,
            deferred: Vec::new(),
            closed: false,
            effects: Vec::new(),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn buffer(&self) -> &EditBuffer {
        &self.buffer
    }

    pub fn cursor(&self) -> CursorState {
        self.cursor
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Terminal width for laying out lines longer than the terminal.
    pub fn set_terminal_width(&mut self, columns: Option<usize>) {
        self.renderer.set_columns(columns);
    }

    pub fn load_history(&mut self, entries: Vec<String>) {
        self.history.load(entries);
    }

    /// Seeds the working and home directories as reported by the remote.
    pub fn set_working_directory(&mut self, cwd: &str, home: Option<&str>) {
        let cwd = cwd.trim();
        if !cwd.is_empty() {
            self.state.working_directory = cwd.to_string();
        }
        if let Some(home) = home.map(str::trim).filter(|h| !h.is_empty()) {
            self.state.home = Some(home.to_string());
        }
    }

    /// First output of a new session: either the prompt, or the setup line
    /// that makes the remote prompt report itself.
    pub fn start(&mut self) -> Vec<Effect> {
        if self.settings.prompt_marker {
            let setup = format!("{}\n", self.settings.prompt_setup);
            self.push(Effect::Send(setup.into_bytes()));
            self.state.awaiting_prompt = true;
        } else {
            self.draw_fresh();
        }
        self.finish()
    }

    /// Raw bytes from the local terminal.
    pub fn handle_input(&mut self, bytes: &[u8]) -> Vec<Effect> {
        if !self.closed {
            self.consume_input(bytes);
        }
        self.finish()
    }

    /// Raw bytes from the remote shell.
    pub fn handle_remote_output(&mut self, bytes: &[u8]) -> Vec<Effect> {
        if self.closed {
            return Vec::new();
        }
        for segment in self.scanner.scan(bytes) {
            match segment {
                Segment::Bytes(bytes) => self.show_remote(&bytes),
                Segment::Marker(marker) => self.on_marker(marker),
            }
        }
        self.finish()
    }

    /// Outcome of the `cd` round trip: the confirmed directory or an error.
    pub fn directory_resolved(
        &mut self,
        change: DirectoryChange,
        result: Result<String, String>,
    ) -> Vec<Effect> {
        self.resolving = false;
        if self.closed {
            return self.finish();
        }
        match result {
            Ok(dir) => {
                let dir = dir.trim().to_string();
                info!(target: "session", from = %self.state.working_directory, to = %dir, "working directory changed");
                let old = std::mem::replace(&mut self.state.working_directory, dir);
                self.state.previous_working_directory = Some(old);
                self.forward_command(&change.command, true);
            }
            Err(err) => {
                warn!(target: "session", target_dir = %change.target, error = %err, "cd failed");
                self.print_line(&format!("cd: {}: {}", change.target, err).red().to_string());
                self.draw_fresh();
            }
        }
        let held = std::mem::take(&mut self.held_input);
        if !held.is_empty() {
            self.consume_input(&held);
        }
        self.finish()
    }

    /// Directory listing for a path completion.
    pub fn completion_ready(
        &mut self,
        request: CompletionRequest,
        result: Result<Vec<DirEntry>, String>,
    ) -> Vec<Effect> {
        if self.completing.as_ref() != Some(&request) {
            debug!(target: "session", token = %request.token, "stale completion dropped");
            return self.finish();
        }
        self.completing = None;
        match result {
            Ok(entries) => {
                let candidates = completer::complete_entries(&request, &entries);
                self.apply_candidates(&request, candidates);
            }
            Err(err) => {
                debug!(target: "session", directory = %request.directory, error = %err, "completion listing failed");
            }
        }
        self.finish()
    }

    pub fn transfer_event(&mut self, event: TransferEvent) -> Vec<Effect> {
        if self.closed {
            return Vec::new();
        }
        match event {
            TransferEvent::Progress(transfer) => {
                self.progress = Some(transfer.progress_line());
                self.refresh_status();
            }
            TransferEvent::Finished(transfer) => {
                self.progress = None;
                if transfer.direction == Direction::Upload {
                    self.push(Effect::RefreshTree(Refresh {
                        paths: vec![transfer.remote_dir()],
                        delay: Duration::ZERO,
                    }));
                }
                self.notify(transfer.summary().green().to_string());
            }
            TransferEvent::Failed { transfer, error } => {
                self.progress = None;
                self.notify(transfer.failure(&error).red().to_string());
            }
        }
        self.finish()
    }

    /// A transfer could not be started.
    pub fn transfer_rejected(&mut self, error: &TransferError) -> Vec<Effect> {
        if !self.closed {
            self.notify(error.to_string().red().to_string());
        }
        self.finish()
    }

    /// The shell channel failed; the session is over.
    pub fn transport_failed(&mut self, error: &str) -> Vec<Effect> {
        self.close(&format!("connection lost: {error}"))
    }

    /// The remote shell exited.
    pub fn channel_closed(&mut self) -> Vec<Effect> {
        self.close("remote shell closed")
    }

    fn consume_input(&mut self, bytes: &[u8]) {
        if self.resolving {
            self.held_input.extend_from_slice(bytes);
            return;
        }
        if self.state.phase == Phase::EditorPassthrough {
            self.forward_passthrough(bytes.to_vec());
            return;
        }
        let bytes = if self.secret_input {
            self.forward_secret(bytes)
        } else {
            bytes
        };

        self.decoder.push(bytes);
        while let Some(key) = self.decoder.next_key() {
            self.handle_key(key);
            if self.state.phase == Phase::EditorPassthrough {
                let rest = self.decoder.drain_raw();
                if !rest.is_empty() {
                    self.forward_passthrough(rest);
                }
                return;
            }
            if self.resolving {
                let rest = self.decoder.drain_raw();
                self.held_input.extend(rest);
                return;
            }
        }
    }

    fn handle_key(&mut self, key: Key) {
        if !matches!(key, Key::Tab) {
            self.completing = None;
        }
        let (line, column) = self.cursor.position();
        match key {
            Key::Text(text) => self.insert_text(&text),
            Key::Paste(text) => self.paste(&text),
            Key::Enter => self.enter(),
            Key::Backspace => self.backspace(),
            Key::Delete => self.delete(),
            Key::Tab => self.complete(),
            Key::Interrupt => self.interrupt(),
            Key::ClearScreen => self.clear_screen(),
            Key::Up => self.up(),
            Key::Down => self.down(),
            Key::Left => {
                if let Some((line, column)) = step_left(&self.buffer, line, column) {
                    self.move_cursor(line, column);
                }
            }
            Key::Right => {
                if let Some((line, column)) = step_right(&self.buffer, line, column) {
                    self.move_cursor(line, column);
                }
            }
            Key::Home => self.move_cursor(line, 0),
            Key::End => self.move_cursor(line, self.buffer.line_length(line)),
            Key::Insert => {
                self.cursor.insert_mode = !self.cursor.insert_mode;
                self.renderer.cursor_style(self.cursor.insert_mode);
            }
            Key::PageUp | Key::PageDown => {}
        }
    }

    // ---- editing ----

    fn insert_text(&mut self, text: &str) {
        let (line, column) = self.cursor.position();
        let change = self.buffer.insert_at(line, column, text);
        self.cursor.column += text.chars().count();
        self.render(change);
    }

    /// Pasted line breaks become separate buffer lines; tabs become spaces
    /// and other control characters are dropped.
    fn paste(&mut self, text: &str) {
        let text = text.strip_suffix('\n').unwrap_or(text);
        let cleaned: String = text
            .chars()
            .filter_map(|c| match c {
                '\t' => Some(' '),
                '\n' => Some('\n'),
                c if c.is_control() => None,
                c => Some(c),
            })
            .collect();
        if cleaned.is_empty() {
            return;
        }

        let (start_line, start_column) = self.cursor.position();
        for (idx, piece) in cleaned.split('\n').enumerate() {
            if idx > 0 {
                let (line, column) = self.cursor.position();
                self.buffer.split_at(line, column);
                self.cursor.line += 1;
                self.cursor.column = 0;
            }
            if !piece.is_empty() {
                let (line, column) = self.cursor.position();
                self.buffer.insert_at(line, column, piece);
                self.cursor.column += piece.chars().count();
            }
        }
        self.redraw_from(start_line, start_column);
    }

    fn backspace(&mut self) {
        let (line, column) = self.cursor.position();
        if column > 0 {
            self.cursor.column -= 1;
            let change = self.buffer.delete_at(line, column - 1, 1);
            self.render(change);
        } else if line > 0 {
            self.cursor.line = line - 1;
            self.cursor.column = self.buffer.line_length(line - 1);
            let change = self.buffer.join_with_next(line - 1);
            self.render(change);
        }
    }

    fn delete(&mut self) {
        let (line, column) = self.cursor.position();
        if column < self.buffer.line_length(line) {
            let change = self.buffer.delete_at(line, column, 1);
            self.render(change);
        } else if line + 1 < self.buffer.total_lines() {
            let change = self.buffer.join_with_next(line);
            self.render(change);
        }
    }

    fn up(&mut self) {
        if self.buffer.total_lines() > 1 {
            let line = self.cursor.line;
            if line > 0 {
                let column = self.cursor.column.min(self.buffer.line_length(line - 1));
                self.move_cursor(line - 1, column);
            }
            return;
        }
        if let Some(entry) = self.history.previous().map(str::to_string) {
            self.replace_buffer(&entry);
        }
    }

    fn down(&mut self) {
        if self.buffer.total_lines() > 1 {
            let line = self.cursor.line;
            if line + 1 < self.buffer.total_lines() {
                let column = self.cursor.column.min(self.buffer.line_length(line + 1));
                self.move_cursor(line + 1, column);
            }
            return;
        }
        if let Some(entry) = self.history.next().map(str::to_string) {
            self.replace_buffer(&entry);
        }
    }

    fn replace_buffer(&mut self, text: &str) {
        let change = self.buffer.replace_all(text);
        self.cursor.line = 0;
        self.cursor.column = self.buffer.line_length(0);
        self.render(change);
    }

    fn move_cursor(&mut self, line: usize, column: usize) {
        self.cursor.line = line;
        self.cursor.column = column;
        if self.editor_visible {
            let width = self.lead_width();
            self.renderer.move_to(&self.buffer, width, line, column);
        }
    }

    // ---- submission ----

    fn enter(&mut self) {
        if self.state.awaiting_prompt {
            self.answer_remote();
        } else if self.continues_line() {
            self.continue_line();
        } else {
            self.submit();
        }
    }

    /// An unescaped backslash right before the cursor.
    fn continues_line(&self) -> bool {
        let (line, column) = self.cursor.position();
        let backslashes = self.buffer.line_chars(line)[..column]
            .iter()
            .rev()
            .take_while(|&&c| c == '\\')
            .count();
        backslashes % 2 == 1
    }

    fn continue_line(&mut self) {
        let (line, column) = self.cursor.position();
        let at = column - 1;
        self.buffer.delete_at(line, at, 1);
        self.buffer.split_at(line, at);
        self.buffer.set_continued(line, true);
        self.cursor.line = line + 1;
        self.cursor.column = 0;
        self.redraw_from(line, at);
    }

    fn submit(&mut self) {
        let command = self.buffer.wire_text().trim().to_string();
        let entry = self.buffer.history_text();
        self.leave_editor();
        self.reset();
        if command.is_empty() {
            self.draw_fresh();
            return;
        }
        if self.history.record_submission(&entry) {
            self.push(Effect::HistoryAppend(entry.trim().to_string()));
        }

        let dispatch = {
            let location = Location {
                cwd: &self.state.working_directory,
                previous: self.state.previous_working_directory.as_deref(),
                home: self.state.home.as_deref(),
                local_dir: &self.settings.local_dir,
            };
            dispatch::classify(&command, &location, &self.settings.dispatch)
        };
        debug!(target: "dispatch", command = %command, ?dispatch, "submitted");

        match dispatch {
            Err(err) => {
                self.print_line(&err.to_string().red().to_string());
                self.draw_fresh();
            }
            Ok(Dispatch::ChangeDirectory { target }) => {
                self.resolving = true;
                self.push(Effect::ResolveDirectory(DirectoryChange { target, command }));
            }
            Ok(Dispatch::Transfer(request)) => {
                self.push(Effect::StartTransfer(request));
                self.draw_fresh();
            }
            Ok(Dispatch::FullScreen { program }) => {
                self.forward_command(&command, false);
                self.state.phase = Phase::EditorPassthrough;
                let watcher = ExitWatcher::new(&program);
                debug!(target: "session", program = %program, kind = ?watcher.kind(), "full-screen program started");
                self.watcher = Some(watcher);
            }
            Ok(Dispatch::Interrupt) => {
                self.push(Effect::Send(vec![INTERRUPT]));
                self.draw_fresh();
            }
            Ok(Dispatch::Forward { refresh }) => {
                self.forward_command(&command, true);
                if let Some(refresh) = refresh {
                    self.push(Effect::RefreshTree(refresh));
                }
            }
        }
    }

    /// Enter while a command runs: the line is input for that command.
    fn answer_remote(&mut self) {
        let line = self.buffer.wire_text();
        self.leave_editor();
        self.reset();
        self.push(Effect::Send(format!("{line}\n").into_bytes()));
    }

    fn forward_command(&mut self, command: &str, draw_prompt: bool) {
        info!(target: "session", command, "forward");
        self.push(Effect::Send(format!("{command}\n").into_bytes()));
        if self.settings.prompt_marker {
            self.state.awaiting_prompt = true;
        } else if draw_prompt {
            self.draw_fresh();
        }
    }

    fn interrupt(&mut self) {
        let awaiting = self.state.awaiting_prompt;
        if self.editor_visible {
            let width = self.lead_width();
            if awaiting || self.state.phase == Phase::MultiLine {
                let rows = self.lead_rows();
                self.renderer.erase(&self.buffer, width, rows);
            } else {
                let end = self.buffer.line_length(0);
                self.renderer.move_to(&self.buffer, width, 0, end);
                self.renderer.write("^C\r\n");
                self.renderer.reset();
                self.at_line_start = true;
            }
            self.editor_visible = false;
        }
        self.push(Effect::Send(vec![INTERRUPT]));
        self.reset();
        if awaiting {
            self.renderer.write("^C");
            self.at_line_start = false;
        } else {
            self.draw_fresh();
        }
    }

    fn clear_screen(&mut self) {
        self.renderer.clear_screen();
        self.editor_visible = false;
        self.progress_shown = false;
        self.at_line_start = true;
        self.reset();
        if !self.state.awaiting_prompt {
            self.draw_fresh();
        }
    }

    // ---- completion ----

    fn complete(&mut self) {
        let (line, column) = self.cursor.position();
        let mut earlier = String::new();
        for previous in 0..line {
            earlier.push_str(&self.buffer.line_text(previous));
            earlier.push_str(if self.buffer.is_continued(previous) { " " } else { " ; " });
        }
        let line_before: String = self.buffer.line_chars(line)[..column].iter().collect();

        let request = {
            let context = CompletionContext {
                cwd: &self.state.working_directory,
                home: self.state.home.as_deref(),
                privilege_wrappers: &self.settings.dispatch.privilege_wrappers,
            };
            completer::analyze(&earlier, &line_before, line, &context)
        };
        match request.target {
            Target::Command => {
                let candidates = completer::complete_commands(&request, &self.settings.commands);
                self.apply_candidates(&request, candidates);
            }
            Target::Path => {
                self.completing = Some(request.clone());
                self.push(Effect::ListDirectory(request));
            }
        }
    }

    fn apply_candidates(&mut self, request: &CompletionRequest, candidates: Vec<Candidate>) {
        match candidates.as_slice() {
            [] => {}
            [only] => {
                let mut replacement = only.replacement.clone();
                if only.terminal {
                    replacement.push(' ');
                }
                self.replace_token(request, &replacement);
            }
            _ => {
                let prefix = completer::common_prefix(&candidates);
                if prefix.chars().count() > request.token.chars().count() {
                    self.replace_token(request, &prefix);
                }
                self.list_candidates(&candidates);
            }
        }
    }

    fn replace_token(&mut self, request: &CompletionRequest, text: &str) {
        let line = request.line;
        let start = request.token_start;
        self.buffer.delete_at(line, start, request.cursor - start);
        self.buffer.insert_at(line, start, text);
        self.cursor.line = line;
        self.cursor.column = start + text.chars().count();
        if self.editor_visible {
            let width = self.lead_width();
            self.renderer
                .redraw_line(&self.buffer, width, line, start, self.cursor.position());
        } else {
            self.draw_editor();
        }
    }

    fn list_candidates(&mut self, candidates: &[Candidate]) {
        let listing = candidates
            .iter()
            .map(|c| c.display.as_str())
            .collect::<Vec<_>>()
            .join("  ");
        self.leave_editor();
        self.renderer.write(&listing);
        self.renderer.write("\r\n");
        self.progress_shown = false;
        self.draw_editor();
    }

    // ---- remote output ----

    fn show_remote(&mut self, bytes: &[u8]) {
        if self.state.phase == Phase::EditorPassthrough {
            self.renderer.write_bytes(bytes);
            return;
        }

        self.hide_editor();
        let text = self.translate_newlines(bytes);
        self.renderer.write_bytes(&text);
        if let Some(&last) = text.last() {
            self.at_line_start = last == b'\n' || last == b'\r';
        }
        self.progress_shown = false;

        if self.state.awaiting_prompt {
            if asks_for_secret(&text) {
                debug!(target: "session", "remote asks for a secret");
                self.secret_input = true;
            }
            if !self.buffer.is_empty() {
                self.draw_editor();
            }
        } else {
            self.new_line();
            self.draw_fresh();
        }
    }

    /// Raw mode turns off output post-processing, and remote output without
    /// a pty only has `\n`.
    fn translate_newlines(&mut self, bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(bytes.len() + 8);
        for &byte in bytes {
            if byte == b'\n' && !self.last_was_cr {
                out.push(b'\r');
            }
            out.push(byte);
            self.last_was_cr = byte == b'\r';
        }
        out
    }

    fn on_marker(&mut self, marker: Marker) {
        match marker {
            Marker::AltScreenEnter => {
                if self.state.phase != Phase::EditorPassthrough {
                    debug!(target: "session", "alternate screen entered");
                    self.hide_editor();
                    self.reset();
                    self.state.phase = Phase::EditorPassthrough;
                    self.watcher = Some(ExitWatcher::new(""));
                }
            }
            Marker::AltScreenExit => {
                if self.state.phase == Phase::EditorPassthrough {
                    // the terminal restores the cursor of the main screen
                    self.at_line_start = true;
                    self.leave_passthrough();
                }
            }
            Marker::CommandDone => {
                if !self.state.awaiting_prompt {
                    return;
                }
                self.hide_editor();
                self.state.awaiting_prompt = false;
                self.secret_input = false;
                if self.state.phase == Phase::EditorPassthrough {
                    self.leave_passthrough();
                } else {
                    self.new_line();
                    self.draw_fresh();
                }
            }
        }
    }

    fn forward_passthrough(&mut self, bytes: Vec<u8>) {
        let done = self
            .watcher
            .as_mut()
            .is_some_and(|watcher| watcher.observe(&bytes));
        self.push(Effect::Send(bytes));
        if done {
            self.leave_passthrough();
        }
    }

    /// Forwards keys up to and including Enter without echo. Returns the
    /// bytes after the line.
    fn forward_secret<'a>(&mut self, bytes: &'a [u8]) -> &'a [u8] {
        let Some(end) = bytes.iter().position(|&b| b == b'\r' || b == b'\n') else {
            self.push(Effect::Send(bytes.to_vec()));
            return &[];
        };
        let mut line = bytes[..end].to_vec();
        line.push(b'\n');
        self.push(Effect::Send(line));
        self.secret_input = false;
        self.renderer.write("\r\n");
        self.at_line_start = true;

        let rest = &bytes[end + 1..];
        if bytes[end] == b'\r' {
            rest.strip_prefix(b"\n").unwrap_or(rest)
        } else {
            rest
        }
    }

    fn leave_passthrough(&mut self) {
        debug!(target: "session", "full-screen program finished");
        self.reset();
        self.last_was_cr = false;
        let cwd = self.state.working_directory.clone();
        self.push(Effect::RefreshTree(Refresh {
            paths: vec![cwd],
            delay: Duration::ZERO,
        }));
        if !self.state.awaiting_prompt {
            self.new_line();
            self.draw_fresh();
        }
    }

    // ---- screen ----

    fn lead_width(&self) -> usize {
        if self.state.awaiting_prompt {
            0
        } else {
            self.prompt
                .width(&self.state.working_directory, self.state.home.as_deref())
        }
    }

    fn lead_rows(&self) -> usize {
        if self.state.awaiting_prompt {
            0
        } else {
            self.prompt.rows()
        }
    }

    fn prompt_on_screen(&self) -> bool {
        self.editor_visible
            && !self.state.awaiting_prompt
            && self.state.phase != Phase::EditorPassthrough
    }

    fn render(&mut self, change: Change) {
        if self.editor_visible {
            let width = self.lead_width();
            self.renderer
                .apply(&change, &self.buffer, width, self.cursor.position());
        } else {
            self.draw_editor();
        }
        self.sync_phase();
    }

    fn redraw_from(&mut self, line: usize, column: usize) {
        if self.editor_visible {
            let width = self.lead_width();
            self.renderer
                .redraw_from(&self.buffer, width, line, column, self.cursor.position());
        } else {
            self.draw_editor();
        }
        self.sync_phase();
    }

    fn sync_phase(&mut self) {
        if self.state.phase != Phase::EditorPassthrough {
            self.state.phase = if self.buffer.total_lines() > 1 {
                Phase::MultiLine
            } else {
                Phase::Normal
            };
        }
    }

    /// Draws the prompt (none while a command runs) and the buffer at the
    /// terminal cursor.
    fn draw_editor(&mut self) {
        self.renderer.reset();
        let (prompt, width) = if self.state.awaiting_prompt {
            (String::new(), 0)
        } else {
            let cwd = &self.state.working_directory;
            let home = self.state.home.as_deref();
            (self.prompt.render(cwd, home), self.prompt.width(cwd, home))
        };
        self.renderer
            .draw(&prompt, width, &self.buffer, self.cursor.position());
        self.editor_visible = true;
    }

    /// Pending messages, the transfer status line, then the prompt. The
    /// terminal cursor must be at the start of a line.
    fn draw_fresh(&mut self) {
        for message in std::mem::take(&mut self.deferred) {
            self.renderer.write(&message);
            self.renderer.write("\r\n");
        }
        self.progress_shown = false;
        if let Some(progress) = self.progress.clone() {
            self.renderer.write(&progress);
            self.renderer.write("\r\n");
            self.progress_shown = true;
        }
        self.at_line_start = true;
        self.draw_editor();
    }

    fn hide_editor(&mut self) {
        if self.editor_visible {
            let width = self.lead_width();
            let rows = self.lead_rows();
            self.renderer.erase(&self.buffer, width, rows);
            self.editor_visible = false;
        }
    }

    /// Moves below the buffer so output can follow.
    fn leave_editor(&mut self) {
        if self.editor_visible {
            let width = self.lead_width();
            self.renderer.leave(&self.buffer, width);
            self.editor_visible = false;
        } else if !self.at_line_start {
            self.renderer.write("\r\n");
        }
        self.at_line_start = true;
    }

    fn new_line(&mut self) {
        if !self.at_line_start {
            self.renderer.write("\r\n");
            self.at_line_start = true;
        }
    }

    fn print_line(&mut self, text: &str) {
        self.new_line();
        self.renderer.write(text);
        self.renderer.write("\r\n");
    }

    /// Shows `message` above the prompt, or with the next prompt when none
    /// is on screen.
    fn notify(&mut self, message: String) {
        self.deferred.push(message);
        self.refresh_status();
    }

    fn refresh_status(&mut self) {
        if !self.prompt_on_screen() {
            return;
        }
        self.hide_editor();
        if self.progress_shown {
            self.renderer.clear_previous_row();
            self.progress_shown = false;
        }
        self.draw_fresh();
    }

    // ---- state ----

    /// Back to an empty buffer in Normal phase. Insert mode survives.
    fn reset(&mut self) {
        self.buffer.clear();
        self.cursor = CursorState {
            insert_mode: self.cursor.insert_mode,
            ..CursorState::default()
        };
        self.state.phase = Phase::Normal;
        self.watcher = None;
        self.completing = None;
        self.history.reset_navigation();
    }

    fn close(&mut self, message: &str) -> Vec<Effect> {
        if self.closed {
            return Vec::new();
        }
        warn!(target: "session", reason = message, "session closed");
        self.hide_editor();
        let rest = self.scanner.flush();
        if !rest.is_empty() {
            self.renderer.write_bytes(&rest);
            self.at_line_start = false;
        }
        self.new_line();
        self.renderer.write(&message.red().to_string());
        self.renderer.write("\r\n");

        self.reset();
        self.decoder.reset();
        self.state.awaiting_prompt = false;
        self.secret_input = false;
        self.resolving = false;
        self.held_input.clear();
        self.progress = None;
        self.deferred.clear();
        self.closed = true;
        self.finish()
    }

    fn push(&mut self, effect: Effect) {
        self.flush_display();
        self.effects.push(effect);
    }

    fn flush_display(&mut self) {
        let out = self.renderer.take();
        if !out.is_empty() {
            self.effects.push(Effect::Display(out));
        }
    }

    fn finish(&mut self) -> Vec<Effect> {
        self.flush_display();
        std::mem::take(&mut self.effects)
    }
}

/// The last output line is a password or passphrase prompt.
fn asks_for_secret(text: &[u8]) -> bool {
    let tail = text.rsplit(|&b| b == b'\n').next().unwrap_or(text);
    let tail = String::from_utf8_lossy(tail).to_lowercase();
    let tail = tail.trim_end();
    tail.ends_with(':') && (tail.contains("password") || tail.contains("passphrase"))
}
