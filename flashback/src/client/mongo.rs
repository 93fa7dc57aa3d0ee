//! [`Session`] adapter over the official `mongodb` driver.
//!
//! Copying a session clones the pooled client, which is cheap and gives
//! every worker the same topology view. Refreshing rebuilds the client from
//! its saved options, abandoning whatever pool state went bad. Captured
//! updates come in two shapes and route accordingly: operator-style
//! mutations (`$set`, ...) go through `update_one`/`find_one_and_update`,
//! whole-document replacements through `replace_one`/`find_one_and_replace`.
//!
//! Error mapping mirrors the driver the capture was taken against: a
//! matched-nothing update, remove or find-and-modify reports
//! [`Error::NotFound`]; server command errors map to [`Error::Query`],
//! write errors to [`Error::LastError`], everything else to
//! [`Error::Transport`].

use async_trait::async_trait;
use bson::Document;
use futures::TryStreamExt;
use mongodb::Client;
use mongodb::error::ErrorKind;
use mongodb::options::ClientOptions;
use tracing::warn;

use super::{Collection, Error, Session};

#[derive(Debug, Clone)]
/// A session backed by a pooled `mongodb` client.
pub struct MongoSession {
    client: Client,
    options: ClientOptions,
}

impl MongoSession {
    /// Connect to the deployment at `uri`.
    ///
    /// # Errors
    ///
    /// [`Error::Transport`] when the URI does not parse or the client
    /// cannot be constructed.
    pub async fn connect(uri: &str) -> Result<Self, Error> {
        let options = ClientOptions::parse(uri)
            .await
            .map_err(|error| Error::Transport(error.to_string()))?;
        let client = Client::with_options(options.clone())
            .map_err(|error| Error::Transport(error.to_string()))?;
        Ok(Self { client, options })
    }
}

#[async_trait]
impl Session for MongoSession {
    type Collection = MongoCollection;

    fn copy(&self) -> Self {
        Self {
            client: self.client.clone(),
            options: self.options.clone(),
        }
    }

    async fn refresh(&mut self) {
        match Client::with_options(self.options.clone()) {
            Ok(client) => self.client = client,
            Err(error) => warn!(%error, "session refresh failed, keeping the existing client"),
        }
    }

    fn collection(&self, database: &str, name: &str) -> MongoCollection {
        MongoCollection {
            inner: self.client.database(database).collection::<Document>(name),
        }
    }
}

#[derive(Debug, Clone)]
/// A collection handle backed by the `mongodb` driver.
pub struct MongoCollection {
    inner: mongodb::Collection<Document>,
}

#[async_trait]
impl Collection for MongoCollection {
    async fn find(&self, query: Document, skip: i32, limit: i32) -> Result<Vec<Document>, Error> {
        let mut find = self.inner.find(query);
        if skip > 0 {
            find = find.skip(u64::from(skip.unsigned_abs()));
        }
        if limit > 0 {
            find = find.limit(i64::from(limit));
        }
        let cursor = find.await.map_err(map_error)?;
        cursor.try_collect().await.map_err(map_error)
    }

    async fn insert(&self, doc: Document) -> Result<(), Error> {
        self.inner.insert_one(doc).await.map_err(map_error)?;
        Ok(())
    }

    async fn update(&self, query: Document, update: Document) -> Result<(), Error> {
        let matched = if is_operator_update(&update) {
            self.inner
                .update_one(query, update)
                .await
                .map_err(map_error)?
                .matched_count
        } else {
            self.inner
                .replace_one(query, update)
                .await
                .map_err(map_error)?
                .matched_count
        };
        if matched == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    async fn remove(&self, query: Document) -> Result<(), Error> {
        let result = self.inner.delete_one(query).await.map_err(map_error)?;
        if result.deleted_count == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    async fn count(&self) -> Result<u64, Error> {
        self.inner
            .count_documents(Document::new())
            .await
            .map_err(map_error)
    }

    async fn find_and_modify(
        &self,
        query: Document,
        update: Document,
    ) -> Result<Document, Error> {
        let modified = if is_operator_update(&update) {
            self.inner
                .find_one_and_update(query, update)
                .await
                .map_err(map_error)?
        } else {
            self.inner
                .find_one_and_replace(query, update)
                .await
                .map_err(map_error)?
        };
        modified.ok_or(Error::NotFound)
    }
}

/// Operator-style mutations start every key with `$`; anything else is a
/// whole-document replacement and must route to the replace calls.
fn is_operator_update(update: &Document) -> bool {
    update.iter().next().is_some_and(|(key, _)| key.starts_with('$'))
}

fn map_error(error: mongodb::error::Error) -> Error {
    match *error.kind {
        ErrorKind::Command(_) => Error::Query(error.to_string()),
        ErrorKind::Write(_) => Error::LastError(error.to_string()),
        _ => Error::Transport(error.to_string()),
    }
}
