//! Error page markup.

use crate::loader::LoadError;
use crate::utils::html::{escape, strip_ansi};

/// Seconds between automatic reloads of the error page.
pub const REFRESH_SECS: u32 = 2;

/// What the error page shows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorReport {
    pub message: String,
    pub stack: String,
}

impl From<&LoadError> for ErrorReport {
    fn from(err: &LoadError) -> Self {
        Self {
            message: err.message.clone(),
            stack: err.stack.clone(),
        }
    }
}

/// Render the page. Message and stack are stripped of ANSI colours and
/// HTML-escaped; stack line breaks are preserved.
pub fn render(report: &ErrorReport) -> String {
    let message = strip_ansi(&report.message);
    let stack = strip_ansi(&report.stack);
    let message = escape(&message);
    let stack = escape(&stack).replace('\n', "<br />\n");

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta http-equiv="refresh" content="{REFRESH_SECS}">
<title>Application error</title>
<style>
body {{ font-family: system-ui, sans-serif; margin: 2rem; color: #222; }}
h1 {{ color: #b00020; }}
code {{ display: block; padding: 1rem; background: #f6f6f6; white-space: pre-wrap; }}
</style>
</head>
<body>
<h1>You have a code error</h1>
<strong>{message}</strong><br />
<code>
{stack}
</code>
</body>
</html>
"#
    )
}
