use std::collections::VecDeque;
use std::io::Read;

const MAX_LOG_CHARS: usize = 4096;
const MAX_PENDING_BYTES: usize = 16 * 1024;

#[derive(Clone, Copy)]
enum Escape {
    Start,
    Csi,
    Osc,
    OscEsc,
    StString,
    StEsc,
}

impl Escape {
    // Advance the escape parser by one char; `None` means the sequence ended.
    fn step(self, c: char) -> Option<Escape> {
        match self {
            Escape::Start => match c {
                '[' => Some(Escape::Csi),
                ']' => Some(Escape::Osc),
                'P' | 'X' | '^' | '_' => Some(Escape::StString),
                _ => None,
            },
            Escape::Csi => (!('@'..='~').contains(&c)).then_some(Escape::Csi),
            Escape::Osc => match c {
                '\x07' => None,
                '\x1b' => Some(Escape::OscEsc),
                _ => Some(Escape::Osc),
            },
            Escape::OscEsc => match c {
                '\\' => None,
                '\x1b' => Some(Escape::OscEsc),
                _ => Some(Escape::Osc),
            },
            Escape::StString => match c {
                '\x1b' => Some(Escape::StEsc),
                _ => Some(Escape::StString),
            },
            Escape::StEsc => match c {
                '\\' => None,
                '\x1b' => Some(Escape::StEsc),
                _ => Some(Escape::StString),
            },
        }
    }
}

/// Strip terminal escapes and control characters from one line of tool output.
pub fn sanitize_log_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LOG_CHARS));
    let mut escape: Option<Escape> = None;
    let mut count = 0usize;

    for c in input.chars() {
        if let Some(state) = escape {
            escape = state.step(c);
            continue;
        }
        match c {
            '\x1b' => {
                escape = Some(Escape::Start);
                continue;
            }
            '\r' | '\n' => continue,
            '\t' => out.push(' '),
            c if c.is_control() || is_format_control(c) => continue,
            c => out.push(c),
        }
        count += 1;
        if count >= MAX_LOG_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }
    out
}

fn is_format_control(c: char) -> bool {
    c == '\u{061C}'
        || c == '\u{200E}'
        || c == '\u{200F}'
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}

// Attribute a line to its source when several containers log at once.
pub fn prefix_line(prefix: &str, line: &str) -> String {
    format!("{prefix}:{line}")
}

pub fn prefix_block(prefix: &str, block: &str) -> String {
    block
        .lines()
        .map(|l| prefix_line(prefix, l))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Split a raw byte stream into lines on `\n` or `\r`, calling `emit` for each
/// non-empty line. Over-long lines are flushed in chunks.
pub fn for_each_line<R: Read>(mut reader: R, mut emit: impl FnMut(String)) {
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        };
        for b in &buf[..n] {
            if *b == b'\n' || *b == b'\r' {
                if !pending.is_empty() {
                    emit(String::from_utf8_lossy(&pending).into_owned());
                    pending.clear();
                }
            } else {
                pending.push(*b);
                if pending.len() >= MAX_PENDING_BYTES {
                    emit(String::from_utf8_lossy(&pending).into_owned());
                    pending.clear();
                }
            }
        }
    }

    if !pending.is_empty() {
        emit(String::from_utf8_lossy(&pending).into_owned());
    }
}

/// Bounded ring of the most recent lines.
#[derive(Debug, Clone)]
pub struct TailBuffer {
    cap: usize,
    lines: VecDeque<String>,
}

impl TailBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            lines: VecDeque::new(),
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        while self.lines.len() >= self.cap {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn into_vec(self) -> Vec<String> {
        self.lines.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_csi_and_osc_sequences() {
        let input = "ok \u{1b}[31mred\u{1b}[0m \u{1b}]0;title\u{7} done";
        assert_eq!(sanitize_log_line(input), "ok red  done");
    }

    #[test]
    fn strips_st_terminated_sequences() {
        assert_eq!(sanitize_log_line("a\u{1b}Ppayload\u{1b}\\b"), "ab");
    }

    #[test]
    fn strips_newlines_and_tabs_and_bidi_controls() {
        assert_eq!(sanitize_log_line("a\tb\nc\r\u{202e}x"), "a bcx");
    }

    #[test]
    fn splits_on_cr_and_lf() {
        let mut got = Vec::new();
        for_each_line(&b"one\r\ntwo\rthree\n\nfour"[..], |l| got.push(l));
        assert_eq!(got, vec!["one", "two", "three", "four"]);
    }

    #[test]
    fn tail_keeps_newest_lines() {
        let mut tail = TailBuffer::new(2);
        for l in ["a", "b", "c"] {
            tail.push(l);
        }
        assert_eq!(tail.into_vec(), vec!["b", "c"]);
    }

    #[test]
    fn prefixes_every_line() {
        assert_eq!(prefix_block("br", "x\ny"), "br:x\nbr:y");
    }
}
