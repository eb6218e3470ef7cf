use mongodb::{options::ClientOptions, Client, Collection, Database};

use crate::models::{
    Book, CalendarSettings, Dashboard, DocumentSection, EventSignup, GaDocumentSection,
    Notification, Student, User,
};

pub struct MongoDB {
    pub client: Client,
    pub db: Database,
}

impl MongoDB {
    pub async fn init(uri: &str, db_name: &str) -> Self {
        let client_options = ClientOptions::parse(uri)
            .await
            .expect("Failed to parse MongoDB connection string");
        let client = Client::with_options(client_options).expect("Failed to initialize client");
        let db = client.database(db_name);
        MongoDB { client, db }
    }

    pub fn users(&self) -> Collection<User> {
        self.db.collection("users")
    }

    pub fn students(&self) -> Collection<Student> {
        self.db.collection("students")
    }

    pub fn dashboards(&self) -> Collection<Dashboard> {
        self.db.collection("dashboards")
    }

    pub fn books(&self) -> Collection<Book> {
        self.db.collection("books")
    }

    pub fn notifications(&self) -> Collection<Notification> {
        self.db.collection("notifications")
    }

    pub fn documents(&self) -> Collection<DocumentSection> {
        self.db.collection("documents")
    }

    pub fn ga_documents(&self) -> Collection<GaDocumentSection> {
        self.db.collection("ga_documents")
    }

    pub fn event_signups(&self) -> Collection<EventSignup> {
        self.db.collection("event_signups")
    }

    pub fn calendar_settings(&self) -> Collection<CalendarSettings> {
        self.db.collection("calendar_settings")
    }
}
