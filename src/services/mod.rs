mod calibre;
mod mailer;

pub use calibre::{CalibreWrapper, ContentFetcher, FetchError, Recipe};
pub use mailer::{MailError, Mailer, SmtpMailer};
