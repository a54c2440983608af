//! Job report rendering and best-effort email delivery.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use lettre::message::header::ContentType;
use lettre::message::{Attachment as MailAttachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use tracing::{debug, info, warn};

use crate::config::SmtpSettings;
use crate::error::{Error, Result};
use crate::job::{JobResult, JobStatus, Outcome};

const SENDER_NAME: &str = "Indra Automated Pipelines";

/// A file sent along with a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub content: Vec<u8>,
}

impl Attachment {
    pub fn read(path: &Path) -> Result<Self> {
        let content = fs::read(path)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".to_string());
        Ok(Self { file_name, content })
    }
}

/// Anything that can deliver an HTML message.
pub trait Mailer: Send + Sync {
    fn send(&self, recipients: &[String], subject: &str, html: &str, attachments: &[Attachment]) -> Result<()>;
}

/// STARTTLS SMTP relay with login credentials.
pub struct SmtpMailer {
    transport: SmtpTransport,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(settings: &SmtpSettings) -> Result<Self> {
        let from = format!("{SENDER_NAME} <{}>", settings.email)
            .parse::<Mailbox>()
            .map_err(|e| Error::Notification(format!("invalid sender {}: {e}", settings.email)))?;
        let transport = SmtpTransport::starttls_relay(&settings.server)
            .map_err(|e| Error::Notification(format!("cannot use SMTP relay {}: {e}", settings.server)))?
            .port(settings.port)
            .credentials(Credentials::new(settings.email.clone(), settings.password.clone()))
            .timeout(Some(Duration::from_secs(30)))
            .build();
        Ok(Self { transport, from })
    }
}

impl Mailer for SmtpMailer {
    fn send(&self, recipients: &[String], subject: &str, html: &str, attachments: &[Attachment]) -> Result<()> {
        let mut builder = Message::builder().from(self.from.clone()).subject(subject);
        for r in recipients {
            let to = r
                .parse::<Mailbox>()
                .map_err(|e| Error::Notification(format!("invalid recipient {r}: {e}")))?;
            builder = builder.to(to);
        }
        let message = if attachments.is_empty() {
            builder.header(ContentType::TEXT_HTML).body(html.to_string())
        } else {
            let octet_stream = ContentType::parse("application/octet-stream")
                .map_err(|e| Error::Notification(format!("invalid content type: {e}")))?;
            let mut parts = MultiPart::mixed().singlepart(SinglePart::html(html.to_string()));
            for a in attachments {
                parts = parts.singlepart(
                    MailAttachment::new(a.file_name.clone()).body(a.content.clone(), octet_stream.clone()),
                );
            }
            builder.multipart(parts)
        };
        let message = message.map_err(|e| Error::Notification(format!("cannot build message: {e}")))?;

        self.transport
            .send(&message)
            .map_err(|e| Error::Notification(e.to_string()))?;
        Ok(())
    }
}

/// Subject and HTML body of a job report.
pub fn render_report(result: &JobResult, job_name: &str, run_date: NaiveDate) -> (String, String) {
    let status = result.status();
    let prefix = match status {
        JobStatus::Success => "",
        JobStatus::Partial => "Errors raised - ",
        JobStatus::Failure => "CRITICAL ERROR!! - ",
    };
    let subject = format!("{prefix}{job_name} || {}", run_date.format("%Y%m%d"));

    let cell = "border: 1px solid black; padding: 10px";
    let mut html = String::from("<html><body>");
    html.push_str(&format!(
        "<p>Dataset: {} ({})<br>Window: {}<br>Status: {status}</p>",
        escape(&result.dataset),
        escape(&result.source),
        escape(&result.window)
    ));
    if let Some(e) = &result.error {
        html.push_str(&format!("<p>Job error: {}</p>", escape(e)));
    }

    html.push_str("<table style=\"border: 1px solid black;\"><tr style=\"border: 1px solid black;\">");
    for header in ["Component Name", "Status", "Comments"] {
        html.push_str(&format!(
            "<th style='border: 1px solid black; font-size: 20px; padding: 10px'>{header}</th>"
        ));
    }
    html.push_str("</tr>");

    for o in &result.outcomes {
        let (colour, label, comment) = match &o.outcome {
            Outcome::Succeeded { key, bytes } => ("green", "SUCCESS", format!("{key} ({bytes} bytes)")),
            Outcome::Failed { reason } => ("red", "FAILED", reason.clone()),
        };
        html.push_str(&format!(
            "<tr style='border: 1px solid black; font-size: 18px; color: {colour}'>\
             <td style='{cell}'>{}</td><td style='{cell}'>{label}</td><td style='{cell}'>{}</td></tr>",
            escape(&o.name),
            escape(&comment)
        ));
    }
    html.push_str("</table></body></html>");

    (subject, html)
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Sends job reports. Never fails the job: delivery errors are only logged.
#[derive(Clone)]
pub struct NotificationDispatcher {
    mailer: Option<Arc<dyn Mailer>>,
    recipients: Vec<String>,
    job_name: Option<String>,
    /// Sent with reports of jobs that did not fully succeed, usually the run's log file.
    attachment: Option<PathBuf>,
}

impl NotificationDispatcher {
    pub fn new(mailer: Option<Arc<dyn Mailer>>, recipients: Vec<String>, job_name: Option<String>) -> Self {
        Self {
            mailer,
            recipients,
            job_name,
            attachment: None,
        }
    }

    pub fn with_attachment(mut self, path: impl Into<PathBuf>) -> Self {
        self.attachment = Some(path.into());
        self
    }

    fn attachments(&self, status: JobStatus) -> Vec<Attachment> {
        let Some(path) = self.attachment.as_deref().filter(|_| status != JobStatus::Success) else {
            return Vec::new();
        };
        match Attachment::read(path) {
            Ok(a) => vec![a],
            Err(e) => {
                warn!("cannot attach {}: {e}", path.display());
                Vec::new()
            }
        }
    }

    /// SMTP mailer from the environment, or no mailer if the settings are incomplete.
    pub fn from_env(recipients: Vec<String>, job_name: Option<String>) -> Self {
        let mailer: Option<Arc<dyn Mailer>> = match SmtpSettings::from_env() {
            None => {
                warn!("SMTP_SERVER/PORT/EMAIL/PASSWORD not set, email reports disabled");
                None
            }
            Some(settings) => match SmtpMailer::new(&settings) {
                Ok(m) => Some(Arc::new(m) as Arc<dyn Mailer>),
                Err(e) => {
                    warn!("email reports disabled: {e}");
                    None
                }
            },
        };
        Self::new(mailer, recipients, job_name)
    }

    /// Returns whether a report was handed to the mailer.
    pub fn notify(&self, result: &JobResult, run_date: NaiveDate) -> bool {
        let job_name = self
            .job_name
            .clone()
            .unwrap_or_else(|| format!("indra {} {}", result.source, result.dataset));
        let (subject, html) = render_report(result, &job_name, run_date);

        let Some(mailer) = &self.mailer else {
            debug!("no mailer configured, report not sent: {subject}");
            return false;
        };
        if self.recipients.is_empty() {
            debug!("no email recipients configured");
            return false;
        }

        let attachments = self.attachments(result.status());
        match mailer.send(&self.recipients, &subject, &html, &attachments) {
            Ok(()) => {
                info!("report sent to {} recipient(s): {subject}", self.recipients.len());
                true
            }
            Err(e) => {
                warn!("report not sent: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ArtifactOutcome;

    struct BrokenMailer;

    impl Mailer for BrokenMailer {
        fn send(&self, _: &[String], _: &str, _: &str, _: &[Attachment]) -> Result<()> {
            Err(Error::Notification("connection refused".into()))
        }
    }

    #[derive(Default)]
    struct AttachmentLog {
        sent: std::sync::Mutex<Vec<Vec<Attachment>>>,
    }

    impl Mailer for AttachmentLog {
        fn send(&self, _: &[String], _: &str, _: &str, attachments: &[Attachment]) -> Result<()> {
            self.sent.lock().unwrap().push(attachments.to_vec());
            Ok(())
        }
    }

    fn result(outcomes: Vec<Outcome>) -> JobResult {
        JobResult {
            source: "cds".into(),
            dataset: "0001-era5".into(),
            window: "2024-03-01..2024-03-31".into(),
            outcomes: outcomes
                .into_iter()
                .enumerate()
                .map(|(i, outcome)| ArtifactOutcome {
                    name: format!("file-{i}.nc"),
                    request: format!("req-{i}"),
                    outcome,
                })
                .collect(),
            escalated: false,
            error: None,
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
    }

    #[test]
    fn subject_prefix_follows_status() {
        let ok = Outcome::Succeeded { key: "k".into(), bytes: 1 };
        let bad = Outcome::Failed { reason: "boom".into() };

        let (s, _) = render_report(&result(vec![ok.clone()]), "job", day());
        assert_eq!(s, "job || 20240315");
        let (s, _) = render_report(&result(vec![ok, bad.clone()]), "job", day());
        assert_eq!(s, "Errors raised - job || 20240315");
        let (s, _) = render_report(&result(vec![bad]), "job", day());
        assert_eq!(s, "CRITICAL ERROR!! - job || 20240315");
    }

    #[test]
    fn body_lists_every_artifact_escaped() {
        let (_, html) = render_report(
            &result(vec![
                Outcome::Succeeded { key: "0001-era5/file-0.nc".into(), bytes: 42 },
                Outcome::Failed { reason: "status <failed>".into() },
            ]),
            "job",
            day(),
        );
        assert!(html.contains("0001-era5/file-0.nc (42 bytes)"));
        assert!(html.contains("status &lt;failed&gt;"));
        assert!(html.contains("Status: partial"));
        assert_eq!(html.matches("<tr style='border: 1px solid black; font-size: 18px").count(), 2);
    }

    #[test]
    fn delivery_failure_is_swallowed() {
        let d = NotificationDispatcher::new(Some(Arc::new(BrokenMailer) as Arc<dyn Mailer>), vec!["ops@example.org".into()], None);
        assert!(!d.notify(&result(vec![]), day()));

        let silent = NotificationDispatcher::new(None, vec!["ops@example.org".into()], None);
        assert!(!silent.notify(&result(vec![]), day()));
    }

    #[test]
    fn log_file_is_attached_to_failed_reports_only() {
        let tmp = tempfile::TempDir::new().unwrap();
        let log = tmp.path().join("indra_20240315.log");
        fs::write(&log, "ERROR fetch failed\n").unwrap();

        let mailer = Arc::new(AttachmentLog::default());
        let d = NotificationDispatcher::new(
            Some(mailer.clone() as Arc<dyn Mailer>),
            vec!["ops@example.org".into()],
            None,
        )
        .with_attachment(&log);

        assert!(d.notify(&result(vec![Outcome::Failed { reason: "boom".into() }]), day()));
        assert!(d.notify(&result(vec![Outcome::Succeeded { key: "k".into(), bytes: 1 }]), day()));

        let sent = mailer.sent.lock().unwrap();
        assert_eq!(
            sent[0],
            vec![Attachment {
                file_name: "indra_20240315.log".into(),
                content: b"ERROR fetch failed\n".to_vec(),
            }]
        );
        assert!(sent[1].is_empty());
    }

    #[test]
    fn unreadable_attachment_still_sends_report() {
        let mailer = Arc::new(AttachmentLog::default());
        let d = NotificationDispatcher::new(
            Some(mailer.clone() as Arc<dyn Mailer>),
            vec!["ops@example.org".into()],
            None,
        )
        .with_attachment("/nonexistent/indra.log");

        assert!(d.notify(&result(vec![Outcome::Failed { reason: "boom".into() }]), day()));
        assert!(mailer.sent.lock().unwrap()[0].is_empty());
    }
}
