/// Barker-13 with each +1 chip sent as a phase flip.
pub const SYNC_CODE: [bool; 13] = [
    true, true, true, true, true, false, false, true, true, false, true, false, true,
];

/// Moore machine that recognises a fixed boolean sequence.
///
/// State `k` means the last `k` inputs matched the head of the pattern. A
/// wrong input falls back to the longest head of the pattern that is still a
/// tail of the inputs seen, so a stray symbol right before the real sequence
/// does not hide it.
#[derive(Debug, Clone)]
pub struct BarkerMatcher {
    pattern: Vec<bool>,
    /// `fallback[k]`: length of the longest proper prefix of `pattern[..=k]`
    /// that is also its suffix
    fallback: Vec<usize>,
    state: usize,
}

impl BarkerMatcher {
    pub fn new(pattern: &[bool]) -> Self {
        assert!(!pattern.is_empty(), "sync pattern must not be empty");
        Self {
            pattern: pattern.to_vec(),
            fallback: fallback_table(pattern),
            state: 0,
        }
    }

    pub fn sync_code() -> Self {
        Self::new(&SYNC_CODE)
    }

    pub fn state(&self) -> usize {
        self.state
    }

    pub fn pattern_len(&self) -> usize {
        self.pattern.len()
    }

    pub fn reset(&mut self) {
        self.state = 0;
    }

    /// Advance by one input; true when the whole pattern has just been seen.
    pub fn feed(&mut self, input: bool) -> bool {
        while self.state > 0 && input != self.pattern[self.state] {
            self.state = self.fallback[self.state - 1];
        }
        if input == self.pattern[self.state] {
            self.state += 1;
        }

        if self.state == self.pattern.len() {
            self.state = 0;
            return true;
        }
        false
    }
}

fn fallback_table(pattern: &[bool]) -> Vec<usize> {
    let mut table = vec![0; pattern.len()];
    let mut k = 0;
    for i in 1..pattern.len() {
        while k > 0 && pattern[i] != pattern[k] {
            k = table[k - 1];
        }
        if pattern[i] == pattern[k] {
            k += 1;
        }
        table[i] = k;
    }
    table
}

impl Default for BarkerMatcher {
    fn default() -> Self {
        Self::sync_code()
    }
}
