use std::fmt;

/// Position of a work item in the dispatch order, shown as `(index/total)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub index: usize,
    pub total: usize,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}/{})", self.index, self.total)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    Start,
    Retry,
    End,
    Error,
    Wait,
}

impl Notice {
    fn tag(self) -> &'static str {
        match self {
            Notice::Start => "START",
            Notice::Retry => "RETRY",
            Notice::End => "-END-",
            Notice::Error => "ERROR",
            Notice::Wait => "-WAIT",
        }
    }
}

pub fn format_notice(notice: Notice, position: Position, message: &str) -> String {
    format!(" => [{}] {} {}", notice.tag(), position, message)
}

/// Console progress line for the operator; structured detail goes to tracing.
pub fn notify(notice: Notice, position: Position, message: &str) {
    println!("{}", format_notice(notice, position, message));
}
