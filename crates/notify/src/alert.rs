//! Alert messages and their presentation.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

/// Prefix applied to every outbound subject line.
pub const SUBJECT_PREFIX: &str = "PA Monitoring Alert: ";

/// Presentation class of an alert.
///
/// Severity only drives colour coding; it never changes whether or how an
/// alert is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Recovery or successful heal
    Success,
    /// Informational (new server, general notices)
    Info,
    /// Failure requiring attention
    Failure,
}

/// Colour scheme used by the HTML renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Palette {
    pub border: &'static str,
    pub background: &'static str,
    pub text: &'static str,
}

impl Severity {
    /// Classify an alert from its subject and optional server status.
    #[must_use]
    pub fn classify(subject: &str, status: Option<&str>) -> Self {
        let subject = subject.to_lowercase();
        if status == Some("ok") || subject.contains("recover") {
            Self::Success
        } else if subject.contains("new server") {
            Self::Info
        } else {
            Self::Failure
        }
    }

    /// Get the colour palette for this severity.
    #[must_use]
    pub const fn palette(&self) -> Palette {
        match self {
            Self::Success => Palette {
                border: "#28a745",
                background: "#d4edda",
                text: "#155724",
            },
            Self::Info => Palette {
                border: "#17a2b8",
                background: "#d1ecf1",
                text: "#0c5460",
            },
            Self::Failure => Palette {
                border: "#dc3545",
                background: "#f8d7da",
                text: "#721c24",
            },
        }
    }

    /// Get display name for this severity.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS-GREEN",
            Self::Info => "INFO-BLUE",
            Self::Failure => "FAILURE-RED",
        }
    }
}

/// Server details shown in an alert. The diagnostic log is never included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerContext {
    pub name: String,
    pub address: String,
    pub status: String,
}

/// A single operator alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Short subject, without the global prefix
    pub subject: String,
    /// Plain-text body; newlines become line breaks in HTML
    pub body: String,
    /// Server the alert is about, if any
    #[serde(default)]
    pub server: Option<ServerContext>,
    /// Status hint used for severity classification
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    /// Create an alert with a subject and body.
    #[must_use]
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
            server: None,
            status: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach server context.
    #[must_use]
    pub fn with_server(mut self, server: ServerContext) -> Self {
        self.server = Some(server);
        self
    }

    /// Attach a status hint.
    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Severity derived from subject and status.
    #[must_use]
    pub fn severity(&self) -> Severity {
        Severity::classify(&self.subject, self.status.as_deref())
    }

    /// Subject line as delivered.
    #[must_use]
    pub fn full_subject(&self) -> String {
        format!("{SUBJECT_PREFIX}{}", self.subject)
    }

    /// Render the HTML body.
    #[must_use]
    pub fn render_html(&self) -> String {
        let palette = self.severity().palette();
        let subject = escape_html(&self.subject);
        let message = escape_html(&self.body).replace('\n', "<br>");
        let footer = self
            .timestamp
            .with_timezone(&Local)
            .format("%d/%m/%Y, %H:%M:%S");

        let server_box = self.server.as_ref().map_or_else(String::new, |s| {
            format!(
                r#"<div style="background: #e9ecef; padding: 15px; border-radius: 6px; margin: 15px 0; border-left: 4px solid #6c757d;">
<strong style="color: #495057;">Server:</strong> {} ({})<br>
<strong style="color: #495057;">Status:</strong> {}
</div>"#,
                escape_html(&s.name),
                escape_html(&s.address),
                escape_html(&s.status)
            )
        });

        format!(
            r#"<!DOCTYPE html>
<html>
<head>
<style>
body {{ font-family: Arial, sans-serif; margin: 0; padding: 20px; background-color: #f5f5f5; }}
table {{ border-collapse: collapse; mso-table-lspace: 0pt; mso-table-rspace: 0pt; }}
</style>
</head>
<body>
<h2 style="color: #343a40; margin-bottom: 20px;">{subject}</h2>
{server_box}
<table role="presentation" cellspacing="0" cellpadding="0" border="0" width="100%">
<tr>
<td style="border-left: 6px solid {border}; padding: 20px; background: {background}; color: {text}; border-radius: 0 8px 8px 0;">
{message}
</td>
</tr>
</table>
<p style="color: #6c757d; font-size: 12px; margin-top: 20px; font-style: italic;">PA Monitoring System - {footer}</p>
</body>
</html>
"#,
            border = palette.border,
            background = palette.background,
            text = palette.text,
        )
    }
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_classification() {
        assert_eq!(
            Severity::classify("Server Recovered: pa-01", None),
            Severity::Success
        );
        assert_eq!(
            Severity::classify("Server Failure: pa-01", Some("ok")),
            Severity::Success
        );
        assert_eq!(
            Severity::classify("New Server detected", None),
            Severity::Info
        );
        assert_eq!(
            Severity::classify("Server Failure: pa-01", Some("fail")),
            Severity::Failure
        );
        assert_eq!(
            Severity::classify("IO Error - Healing Skipped", None),
            Severity::Failure
        );
    }

    #[test]
    fn test_full_subject_prefix() {
        let alert = Alert::new("Server Failure: pa-01", "down");
        assert_eq!(
            alert.full_subject(),
            "PA Monitoring Alert: Server Failure: pa-01"
        );
    }

    #[test]
    fn test_render_html_includes_server_but_not_log() {
        let alert = Alert::new("Server Failure: pa-01", "line one\nline two")
            .with_server(ServerContext {
                name: "pa-01".to_string(),
                address: "10.0.0.1".to_string(),
                status: "fail".to_string(),
            })
            .with_status("fail");

        let html = alert.render_html();
        assert!(html.contains("pa-01 (10.0.0.1)"));
        assert!(html.contains("line one<br>line two"));
        assert!(html.contains("#dc3545"));
    }

    #[test]
    fn test_render_html_escapes_markup() {
        let html = Alert::new("Subject", "<script>").render_html();
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<script>"));
    }

    #[test]
    fn test_recovery_uses_green_palette() {
        let html = Alert::new("Server Recovered: pa-02", "healthy").render_html();
        assert!(html.contains(Severity::Success.palette().border));
    }
}
