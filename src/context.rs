//! Diagnostic call-site context.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a read, write or execution was requested from.
///
/// Carried into log spans only; it never affects behavior. Use the
/// [`context!`](crate::context!) macro to capture the current call site.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Source file of the call site.
    pub file: Cow<'static, str>,
    /// Line of the call site.
    pub line: u32,
    /// Symbol (function or module path) of the call site.
    pub symbol: Cow<'static, str>,
}

impl ExecutionContext {
    /// Create a context from its parts.
    #[must_use]
    pub const fn new(file: &'static str, line: u32, symbol: &'static str) -> Self {
        Self {
            file: Cow::Borrowed(file),
            line,
            symbol: Cow::Borrowed(symbol),
        }
    }

    /// Context used when the caller supplies none.
    #[must_use]
    pub const fn unknown() -> Self {
        Self::new("<unknown>", 0, "<unknown>")
    }

    /// Returns a copy with `symbol` replaced.
    #[must_use]
    pub fn with_symbol(&self, symbol: impl Into<Cow<'static, str>>) -> Self {
        Self {
            file: self.file.clone(),
            line: self.line,
            symbol: symbol.into(),
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::unknown()
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.symbol, self.file, self.line)
    }
}

/// Captures the current call site as an [`ExecutionContext`].
///
/// ```
/// let ctx = statecraft::context!();
/// assert_eq!(ctx.file, file!());
///
/// let named = statecraft::context!("configure");
/// assert_eq!(named.symbol, "configure");
/// ```
#[macro_export]
macro_rules! context {
    () => {
        $crate::ExecutionContext::new(file!(), line!(), module_path!())
    };
    ($symbol:expr) => {
        $crate::ExecutionContext::new(file!(), line!(), $symbol)
    };
}
