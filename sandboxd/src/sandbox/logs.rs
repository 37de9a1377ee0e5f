/// Ordered log entries of one execution, bounded by count and total bytes.
///
/// Once either bound is hit every later entry is dropped, so the kept entries
/// are always a prefix of what the program logged.
#[derive(Debug)]
pub struct LogBuffer {
    entries: Vec<String>,
    bytes: usize,
    max_entries: usize,
    max_bytes: usize,
    dropped: usize,
}

impl LogBuffer {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            entries: Vec::new(),
            bytes: 0,
            max_entries,
            max_bytes,
            dropped: 0,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.dropped > 0
            || self.entries.len() >= self.max_entries
            || self.bytes + line.len() > self.max_bytes
        {
            self.dropped += 1;
            return;
        }
        self.bytes += line.len();
        self.entries.push(line);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Kept entries, plus one warning entry if anything was dropped.
    pub fn into_entries(mut self) -> Vec<String> {
        if self.dropped > 0 {
            self.entries.push(format!(
                "Warning: log output truncated; {} later entries dropped",
                self.dropped
            ));
        }
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_call_order() {
        let mut logs = LogBuffer::new(10, 1024);
        for line in ["a", "b c", "d"] {
            logs.push(line.to_string());
        }
        assert_eq!(logs.into_entries(), vec!["a", "b c", "d"]);
    }

    #[test]
    fn entry_cap_appends_one_warning() {
        let mut logs = LogBuffer::new(2, 1024);
        for i in 0..5 {
            logs.push(i.to_string());
        }
        assert_eq!(logs.dropped(), 3);
        assert_eq!(
            logs.into_entries(),
            vec![
                "0".to_string(),
                "1".to_string(),
                "Warning: log output truncated; 3 later entries dropped".to_string()
            ]
        );
    }

    #[test]
    fn byte_cap_keeps_a_prefix() {
        let mut logs = LogBuffer::new(100, 5);
        logs.push("abc".to_string());
        logs.push("defg".to_string());
        // Fits on its own, but comes after a dropped entry.
        logs.push("h".to_string());
        assert_eq!(logs.len(), 1);
        assert_eq!(logs.dropped(), 2);
    }
}
