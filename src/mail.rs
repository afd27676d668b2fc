use crate::{EResult, Error};
use log::debug;
use std::io::Write as _;
use std::process::{Command, Stdio};
use std::time::Duration;

pub const DEFAULT_SENDMAIL: &str = "/usr/sbin/sendmail";
pub const DEFAULT_SENDMAIL_TIMEOUT: Duration = Duration::from_secs(30);

pub trait Mailer {
    fn send(&self, subject: &str, body: &str) -> EResult<()>;
}

/// Discards all messages
pub struct NullMailer;

impl Mailer for NullMailer {
    fn send(&self, subject: &str, _body: &str) -> EResult<()> {
        debug!("mail disabled, message dropped: {}", subject);
        Ok(())
    }
}

/// Delivers messages with the local MTA (`sendmail -t -i`)
pub struct SendmailMailer {
    program: String,
    from: String,
    to: Vec<String>,
    timeout: Duration,
}

impl SendmailMailer {
    pub fn new(program: &str, to: Vec<String>) -> Self {
        let host = hostname::get().map_or_else(
            |_| "localhost".to_owned(),
            |h| h.to_string_lossy().to_string(),
        );
        Self {
            program: program.to_owned(),
            from: format!("chamberctl@{}", host),
            to,
            timeout: DEFAULT_SENDMAIL_TIMEOUT,
        }
    }
    #[inline]
    pub fn from_address(mut self, from: &str) -> Self {
        from.clone_into(&mut self.from);
        self
    }
    /// The program is killed if it does not exit in time
    #[inline]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
    fn format_message(&self, subject: &str, body: &str) -> String {
        format!(
            "From: {}\nTo: {}\nDate: {}\nSubject: {}\n\n{}\n",
            self.from,
            self.to.join(", "),
            chrono::Local::now().to_rfc2822(),
            subject,
            body
        )
    }
}

impl Mailer for SendmailMailer {
    fn send(&self, subject: &str, body: &str) -> EResult<()> {
        let mut child = Command::new(&self.program)
            .args(["-t", "-i"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|e| Error::io(format!("unable to launch {}: {}", self.program, e)))?;
        let written = child.stdin.take().map_or(Ok(()), |mut stdin| {
            stdin.write_all(self.format_message(subject, body).as_bytes())
        });
        // stdin is closed here, the child is reaped in any case
        let status = crate::tasks::wait_child(&mut child, self.timeout)?.ok_or_else(|| {
            Error::io(format!(
                "{} timed out after {:?}",
                self.program, self.timeout
            ))
        })?;
        written.map_err(|e| Error::io(format!("unable to write to {}: {}", self.program, e)))?;
        if status.success() {
            debug!("mail sent to {}: {}", self.to.join(", "), subject);
            Ok(())
        } else {
            Err(Error::io(format!("{} exited with {}", self.program, status)))
        }
    }
}
