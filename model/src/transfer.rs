//! Copying followings and bookmarks from one account to another.

use crate::instagram::{CollectionKind, Session};
use anyhow::Error;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// What to copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct CloneOptions {
    #[serde(default = "enabled")]
    pub followings: bool,
    #[serde(default = "enabled")]
    pub bookmarks: bool,
}

impl Default for CloneOptions {
    fn default() -> Self {
        Self {
            followings: true,
            bookmarks: true,
        }
    }
}

fn enabled() -> bool {
    true
}

/// The outcome of copying followings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct FollowingsReport {
    pub followed: usize,
    pub already_following: usize,
    pub failed: usize,
}

/// The outcome of copying bookmarks.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct BookmarksReport {
    pub collections_created: usize,
    pub medias_saved: usize,
    pub failed: usize,
}

/// The outcome of [`clone_account`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct CloneReport {
    pub followings: Option<FollowingsReport>,
    pub bookmarks: Option<BookmarksReport>,
}

/// Copy followings and bookmarks from `source` to `target`.
///
/// Failures to follow a single user or save a single post are logged, counted, and skipped.
/// Failures to list followings or collections abort the whole operation.
pub async fn clone_account<S: Session, T: Session>(
    source: &S,
    target: &T,
    options: CloneOptions,
) -> Result<CloneReport, Error> {
    let mut report = CloneReport::default();
    if options.followings {
        report.followings = Some(clone_followings(source, target).await?);
    }
    if options.bookmarks {
        report.bookmarks = Some(clone_bookmarks(source, target).await?);
    }
    Ok(report)
}

/// Follow, from `target`, every account that `source` follows.
pub async fn clone_followings<S: Session, T: Session>(
    source: &S,
    target: &T,
) -> Result<FollowingsReport, Error> {
    let wanted = source.user_following(&source.user_id(), 0).await?;
    let target_id = target.user_id();
    let existing = target.user_following(&target_id, 0).await?;
    tracing::info!(
        "copying {} followings from {} to {target_id} ({} already followed)",
        wanted.len(),
        source.user_id(),
        existing.len()
    );

    let mut report = FollowingsReport::default();
    for (pk, user) in wanted {
        if pk == target_id || existing.contains_key(&pk) {
            report.already_following += 1;
            continue;
        }
        match target.follow(&pk).await {
            Ok(true) => {
                tracing::debug!("followed {} ({pk})", user.username);
                report.followed += 1;
            }
            Ok(false) => {
                tracing::warn!("follow request for {} ({pk}) was not accepted", user.username);
                report.failed += 1;
            }
            Err(err) => {
                tracing::warn!("failed to follow {} ({pk}): {err:#}", user.username);
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

/// Save, from `target`, every post that `source` has saved, recreating named collections.
///
/// Named collections are copied first. Posts that only appear in "All posts" are then saved
/// without a collection.
pub async fn clone_bookmarks<S: Session, T: Session>(
    source: &S,
    target: &T,
) -> Result<BookmarksReport, Error> {
    let collections = source.collections().await?;
    let mut target_collections = target.collections().await?;
    let mut report = BookmarksReport::default();
    let mut saved = HashSet::new();

    for collection in collections.iter().filter(|c| c.kind == CollectionKind::Media) {
        let medias = source.collection_medias(&collection.id, 0).await?;
        tracing::info!(
            "copying collection {} ({} posts)",
            collection.name,
            medias.len()
        );
        let existing = target_collections
            .iter()
            .find(|c| c.kind == CollectionKind::Media && c.name == collection.name)
            .map(|c| c.id.clone());
        let destination = match existing {
            Some(id) => id,
            None => match target.create_collection(&collection.name).await {
                Ok(created) => {
                    report.collections_created += 1;
                    let id = created.id.clone();
                    target_collections.push(created);
                    id
                }
                Err(err) => {
                    tracing::warn!("failed to create collection {}: {err:#}", collection.name);
                    report.failed += medias.len();
                    continue;
                }
            },
        };

        for media in medias {
            if save(target, &media.id, Some(&destination), &mut report).await {
                saved.insert(media.id);
            }
        }
    }

    for collection in collections
        .iter()
        .filter(|c| c.kind == CollectionKind::AllMedia)
    {
        let medias = source.collection_medias(&collection.id, 0).await?;
        for media in medias {
            if saved.contains(&media.id) {
                continue;
            }
            if save(target, &media.id, None, &mut report).await {
                saved.insert(media.id);
            }
        }
    }

    for collection in collections
        .iter()
        .filter(|c| c.kind == CollectionKind::Product)
    {
        tracing::debug!("skipping product collection {}", collection.name);
    }

    Ok(report)
}

async fn save<T: Session>(
    target: &T,
    media_id: &str,
    collection_id: Option<&str>,
    report: &mut BookmarksReport,
) -> bool {
    match target.save_media(media_id, collection_id).await {
        Ok(true) => {
            report.medias_saved += 1;
            true
        }
        Ok(false) => {
            tracing::warn!("save request for media {media_id} was not accepted");
            report.failed += 1;
            false
        }
        Err(err) => {
            tracing::warn!("failed to save media {media_id}: {err:#}");
            report.failed += 1;
            false
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::instagram::{Credentials, Instagram, LocalClient, LocalSession, ALL_MEDIA_COLLECTION};
    use std::path::Path;

    async fn login(client: &LocalClient, login: &str) -> LocalSession {
        client
            .login(&Credentials {
                login: login.into(),
                password: format!("{login}-pass"),
            })
            .await
            .unwrap()
    }

    fn client() -> LocalClient {
        LocalClient::open(
            Path::new(env!("CARGO_MANIFEST_DIR"))
                .parent()
                .unwrap()
                .join("testdata"),
        )
    }

    #[async_std::test]
    async fn test_clone_followings() {
        let client = client();
        let alice = login(&client, "alice").await;
        let bob = login(&client, "bob").await;

        let report = clone_followings(&alice, &bob).await.unwrap();
        assert_eq!(
            report,
            FollowingsReport {
                followed: 2,
                already_following: 1,
                failed: 0,
            }
        );
        let following = bob.user_following(&bob.user_id(), 0).await.unwrap();
        assert_eq!(
            following.keys().cloned().collect::<Vec<_>>(),
            vec!["2001", "2002", "2003"]
        );

        // Running again is a no-op.
        let report = clone_followings(&alice, &bob).await.unwrap();
        assert_eq!(report.followed, 0);
        assert_eq!(report.already_following, 3);
    }

    #[async_std::test]
    async fn test_clone_bookmarks() {
        let client = client();
        let alice = login(&client, "alice").await;
        let bob = login(&client, "bob").await;

        let report = clone_bookmarks(&alice, &bob).await.unwrap();
        assert_eq!(
            report,
            BookmarksReport {
                // "Travel" is created; "Food" already exists.
                collections_created: 1,
                medias_saved: 4,
                failed: 0,
            }
        );

        let collections = bob.collections().await.unwrap();
        let names = collections
            .iter()
            .map(|c| c.name.as_str())
            .collect::<HashSet<_>>();
        assert_eq!(names, HashSet::from(["All posts", "Food", "Travel"]));

        let food = collections.iter().find(|c| c.name == "Food").unwrap();
        assert_eq!(food.id, "17890100");
        assert_eq!(food.media_count, 1);
        let travel = collections.iter().find(|c| c.name == "Travel").unwrap();
        assert_eq!(travel.media_count, 2);

        let all = bob
            .collection_medias(ALL_MEDIA_COLLECTION, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect::<HashSet<_>>();
        assert_eq!(
            all,
            HashSet::from([
                "3001_2001".to_string(),
                "3002_2001".to_string(),
                "3003_2002".to_string(),
                "3004_2003".to_string(),
            ])
        );
    }

    #[async_std::test]
    async fn test_clone_account_options() {
        let client = client();
        let alice = login(&client, "alice").await;
        let bob = login(&client, "bob").await;

        let report = clone_account(
            &alice,
            &bob,
            CloneOptions {
                followings: true,
                bookmarks: false,
            },
        )
        .await
        .unwrap();
        assert_eq!(report.followings.unwrap().followed, 2);
        assert_eq!(report.bookmarks, None);

        let options: CloneOptions = serde_json::from_str(r#"{"bookmarks": false}"#).unwrap();
        assert!(options.followings);
        assert!(!options.bookmarks);
    }
}
