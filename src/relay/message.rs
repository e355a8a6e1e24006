use serde::Deserialize;

/// One contact-form submission to relay
///
/// Field names follow the JSON payload posted by the front end; the
/// lower-camel spellings are accepted too.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Message {
    /// Display name the visitor gave, quoted at the end of the body
    #[serde(rename = "Sender", alias = "sender", default)]
    pub sender: String,
    #[serde(rename = "Subject", alias = "subject", default)]
    pub subject: String,
    #[serde(rename = "Body", alias = "body", default)]
    pub body: String,
    /// Where to send the visitor once the mail is accepted
    #[serde(rename = "SuccessRedirectUrl", alias = "successRedirectUrl", default)]
    pub success_redirect_url: String,
}

impl Message {
    /// Render the message as it is written into the DATA section
    pub fn render(&self, destination: &str) -> String {
        format!(
            "To: {}\r\nSubject: {}\r\n\r\n{}\r\n\r\nSent by {}",
            destination, self.subject, self.body, self.sender
        )
    }
}
