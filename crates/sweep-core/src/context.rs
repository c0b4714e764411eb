use std::cell::RefCell;
use tracing::Span;

/// Where user-facing progress lines go for one operation.
#[derive(Debug)]
pub enum Console {
    Stdout,
    /// Used by `--json` mode: only the final payload reaches stdout.
    Silent,
    Capture(RefCell<Vec<String>>),
}

/// Logger + console handle for a single CLI operation.
///
/// Built once per command and passed by reference into every component that
/// logs or prints; nothing in the workspace reaches for a global console.
#[derive(Debug)]
pub struct OpContext {
    operation: String,
    experiment: String,
    span: Span,
    console: Console,
}

impl OpContext {
    pub fn new(operation: &str, experiment: &str, console: Console) -> Self {
        let span = tracing::info_span!("sweep", operation = operation, experiment = experiment);
        OpContext {
            operation: operation.to_string(),
            experiment: experiment.to_string(),
            span,
            console,
        }
    }

    /// Context that captures console output instead of printing it.
    pub fn capture(operation: &str, experiment: &str) -> Self {
        Self::new(operation, experiment, Console::Capture(RefCell::new(Vec::new())))
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn experiment(&self) -> &str {
        &self.experiment
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn say(&self, line: impl AsRef<str>) {
        match &self.console {
            Console::Stdout => println!("{}", line.as_ref()),
            Console::Silent => {}
            Console::Capture(lines) => lines.borrow_mut().push(line.as_ref().to_string()),
        }
    }

    pub fn captured(&self) -> Vec<String> {
        match &self.console {
            Console::Capture(lines) => lines.borrow().clone(),
            _ => Vec::new(),
        }
    }
}
