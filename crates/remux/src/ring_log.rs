use parking_lot::Mutex;
use std::collections::VecDeque;

/// Bounded per-job line buffer for remuxer diagnostics. Long captures emit
/// hours of progress lines; only the newest window is kept.
#[derive(Debug)]
pub struct RingLog {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl RingLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
        }
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }

    /// The newest `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let lines = self.lines.lock();
        lines.iter().rev().take(n).rev().cloned().collect()
    }

    /// The whole buffered window as one newline-joined string.
    pub fn contents(&self) -> String {
        let lines = self.lines.lock();
        let mut out = String::new();
        for line in lines.iter() {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_the_newest_window() {
        let log = RingLog::new(3);
        for i in 0..5 {
            log.push(format!("line {i}"));
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.tail(3), vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn contents_joins_lines_in_order() {
        let log = RingLog::new(8);
        log.push("a".to_string());
        log.push("b".to_string());
        assert_eq!(log.contents(), "a\nb\n");
    }

    #[test]
    fn tail_of_short_buffer_returns_everything() {
        let log = RingLog::new(8);
        log.push("only".to_string());
        assert_eq!(log.tail(10), vec!["only"]);
    }
}
