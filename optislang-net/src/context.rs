/// Logging context handed explicitly to the constructors of clients,
/// supervisors and schedulers.
///
/// All log records emitted by an object carrying a context use the
/// context's target, so multiple instances living in one process can be
/// told apart (and filtered) without any global registry.
///
/// The default context logs under the `optislang` target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogContext {
    target: String,
}

impl Default for LogContext {
    fn default() -> Self {
        Self {
            target: "optislang".to_string(),
        }
    }
}

impl LogContext {
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Creates a nested context, e.g. `optislang` -> `optislang::client`.
    pub fn child(&self, name: &str) -> Self {
        Self {
            target: format!("{}::{}", self.target, name),
        }
    }
}

#[test]
fn nested_targets() {
    let ctx = LogContext::default().child("study").child("block");
    assert_eq!(ctx.target(), "optislang::study::block");
    assert_eq!(LogContext::new("x").target(), "x");
}
