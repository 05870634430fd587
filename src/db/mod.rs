use bson::doc;
use mongodb::options::{ClientOptions, IndexOptions, WriteConcern};
use mongodb::{Client, Collection, Database, IndexModel};
use std::time::Duration;
use tracing::info;

use crate::error::AppResult;
use crate::models::{Contact, Group, Message, User};

pub const USERS: &str = "users";
pub const MESSAGES: &str = "messages";
pub const GROUPS: &str = "groups";
pub const CONTACTS: &str = "contacts";

/// Handle on the shared document store with typed collection accessors.
///
/// Cheaply cloneable — `mongodb::Database` is an `Arc` internally.
#[derive(Clone)]
pub struct Store {
    db: Database,
}

impl Store {
    /// Connect to the document store. Connection establishment is capped at
    /// 10 seconds and writes carry a 5 second write-concern timeout; a store
    /// that cannot be reached at startup is fatal for the calling service.
    pub async fn connect(uri: &str, database: &str) -> AppResult<Self> {
        info!("🔌 Connecting to document store...");

        let mut options = ClientOptions::parse(uri).await?;
        options.connect_timeout = Some(Duration::from_secs(10));
        options.server_selection_timeout = Some(Duration::from_secs(5));
        options.write_concern = Some(
            WriteConcern::builder()
                .w_timeout(Duration::from_secs(5))
                .build(),
        );

        let client = Client::with_options(options)?;
        let db = client.database(database);

        info!(database = %database, "✅ Document store client created");
        Ok(Store { db })
    }

    pub fn users(&self) -> Collection<User> {
        self.db.collection(USERS)
    }

    pub fn messages(&self) -> Collection<Message> {
        self.db.collection(MESSAGES)
    }

    pub fn groups(&self) -> Collection<Group> {
        self.db.collection(GROUPS)
    }

    pub fn contacts(&self) -> Collection<Contact> {
        self.db.collection(CONTACTS)
    }

    /// Create the unique indexes the data model relies on. Duplicate
    /// username/email/contact rows surface as code-11000 write errors which
    /// the error layer maps to 409 Conflict.
    pub async fn ensure_indexes(&self) -> AppResult<()> {
        let unique = || IndexOptions::builder().unique(true).build();

        self.users()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "username": 1 })
                    .options(unique())
                    .build(),
            )
            .await?;
        self.users()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "email": 1 })
                    .options(unique())
                    .build(),
            )
            .await?;
        self.contacts()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "user_id": 1, "contact_id": 1 })
                    .options(unique())
                    .build(),
            )
            .await?;

        // Conversation pages and fan-out lookups sort on created_at.
        self.messages()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "sender_id": 1, "receiver_id": 1, "created_at": -1 })
                    .build(),
            )
            .await?;
        self.messages()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "group_id": 1, "created_at": -1 })
                    .build(),
            )
            .await?;
        self.groups()
            .create_index(IndexModel::builder().keys(doc! { "member_ids": 1 }).build())
            .await?;

        info!("✅ Document store indexes ensured");
        Ok(())
    }

    pub async fn health_check(&self) -> AppResult<()> {
        self.db.run_command(doc! { "ping": 1 }).await?;
        Ok(())
    }
}
