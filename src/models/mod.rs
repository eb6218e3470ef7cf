mod book;
mod calendar_settings;
mod dashboard;
mod document;
mod event_signup;
mod ga_document;
mod notification;
mod student;
mod user;

pub use book::{Book, LendingEntry, LendingState};
pub use calendar_settings::CalendarSettings;
pub use dashboard::{
    Dashboard, DashboardDocument, HistoryEvent, HistoryEventType, PaymentStatus, Portfolio,
};
pub use document::{DocumentEntry, DocumentSection};
pub use event_signup::{EventSignup, Signup};
pub use ga_document::{GaContentType, GaDocumentEntry, GaDocumentSection, UserUpload};
pub use notification::{Notification, TargetType};
pub use student::Student;
pub use user::{Role, User};
