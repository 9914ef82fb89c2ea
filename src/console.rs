//! Console log of the raw Base traffic.
//!
//! Each line is prefixed with its direction: `<<<` for lines received from a Base,
//! `>>>` for lines sent to one. The last prefix character becomes `!` when the message
//! could not be understood (`<<!`, `>>!`).
use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use log::info;

use crate::errors::StoreError;
use crate::logutil::escape_line;
use crate::storage::Store;

pub const DEFAULT_CONSOLE_LINES: usize = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleLine {
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

pub type LineHandler = Box<dyn FnMut(&ConsoleLine)>;

pub struct ConsoleLog {
    capacity: usize,
    lines: VecDeque<ConsoleLine>,
    handlers: Vec<LineHandler>,
}

pub fn format_line(incoming: bool, valid: bool, raw: &str) -> String {
    let prefix = match (incoming, valid) {
        (true, true) => "<<<",
        (true, false) => "<<!",
        (false, true) => ">>>",
        (false, false) => ">>!",
    };
    format!("{} {}", prefix, escape_line(raw))
}

impl ConsoleLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: VecDeque::with_capacity(capacity),
            handlers: Vec::new(),
        }
    }

    /// Restore the in-memory tail from the store.
    pub fn load(&mut self, store: &Store) -> Result<(), StoreError> {
        self.lines.clear();
        for (timestamp, text) in store.get_console_current()? {
            self.remember(ConsoleLine { timestamp, text });
        }
        Ok(())
    }

    pub fn subscribe_lines(&mut self, handler: LineHandler) {
        self.handlers.push(handler);
    }

    fn remember(&mut self, line: ConsoleLine) {
        if self.capacity == 0 {
            return;
        }
        while self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Record one line of Base traffic: kept in memory, persisted and fanned out.
    pub fn handle_line(
        &mut self,
        store: &mut Store,
        incoming: bool,
        valid: bool,
        raw: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let line = ConsoleLine {
            timestamp,
            text: format_line(incoming, valid, raw),
        };
        info!("{}", line.text);

        store.save_console_line(timestamp, &line.text)?;
        store.commit()?;

        for handler in self.handlers.iter_mut() {
            handler(&line);
        }
        self.remember(line);
        Ok(())
    }

    pub fn recent_lines(&self) -> impl Iterator<Item = &ConsoleLine> {
        self.lines.iter()
    }

    pub fn lines_at(
        &self,
        store: &Store,
        at: Option<DateTime<Utc>>,
    ) -> Result<Vec<ConsoleLine>, StoreError> {
        Ok(store
            .get_console_at_timestamp(at)?
            .into_iter()
            .map(|(timestamp, text)| ConsoleLine { timestamp, text })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreBuilder;
    use std::cell::RefCell;
    use std::rc::Rc;
    use tempfile::tempdir;

    #[test]
    fn prefixes_mark_direction_and_validity() {
        assert_eq!(format_line(true, true, "{}"), "<<< {}");
        assert_eq!(format_line(true, false, "{x"), "<<! {x");
        assert_eq!(format_line(false, true, "{}\n"), ">>> {}");
        assert_eq!(format_line(false, false, "{}"), ">>! {}");
    }

    #[test]
    fn tail_is_bounded_and_survives_reload() {
        let dir = tempdir().unwrap();
        let mut store = StoreBuilder::new(dir.path().join("db")).open().unwrap();
        let mut console = ConsoleLog::new(2);
        let received = Rc::new(RefCell::new(0));
        let counter = received.clone();
        console.subscribe_lines(Box::new(move |_: &ConsoleLine| *counter.borrow_mut() += 1));

        for i in 0..3 {
            console
                .handle_line(&mut store, true, true, &format!("{{\"n\": {}}}", i), Utc::now())
                .unwrap();
        }
        assert_eq!(*received.borrow(), 3);
        let texts: Vec<_> = console.recent_lines().map(|l| l.text.clone()).collect();
        assert_eq!(texts, vec!["<<< {\"n\": 1}", "<<< {\"n\": 2}"]);

        let mut reloaded = ConsoleLog::new(2);
        reloaded.load(&store).unwrap();
        assert_eq!(reloaded.recent_lines().count(), 2);
        assert_eq!(console.lines_at(&store, None).unwrap().len(), 3);
    }
}
