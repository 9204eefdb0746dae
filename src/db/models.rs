use serde::{Deserialize, Serialize};

// ─── Permission ranks ─────────────────────────────────────────────────────────
//
// Flat integer ladder; a user "is" a group when their permission is at or
// above the group's rank. Higher groups therefore inherit every lower
// group's capabilities.

pub mod perms {
    pub const USER: i64 = 0;
    pub const MODERATOR: i64 = 50;
    pub const ADMIN: i64 = 75;
    pub const SUPERADMIN: i64 = 100;
}

// ─── Read models (database rows) ─────────────────────────────────────────────
//
// Each struct maps 1-to-1 to a database table row. `sqlx::FromRow` is derived
// so sqlx can hydrate them directly from query results. All timestamps are
// epoch seconds stored as INTEGER.

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    /// Argon2-encoded; never serialized to clients.
    #[serde(skip_serializing)]
    pub password: String,
    #[serde(skip_serializing)]
    pub token: String,
    pub enabled: bool,
    pub permission: i64,
    pub timestamp: i64,
    pub registration: i64,
}

impl User {
    pub fn is_moderator(&self) -> bool {
        self.permission >= perms::MODERATOR
    }

    pub fn is_admin(&self) -> bool {
        self.permission >= perms::ADMIN
    }

    pub fn group_name(&self) -> &'static str {
        match self.permission {
            p if p >= perms::SUPERADMIN => "superadmin",
            p if p >= perms::ADMIN => "admin",
            p if p >= perms::MODERATOR => "moderator",
            _ => "user",
        }
    }
}

#[cfg(test)]
impl User {
    pub fn test_user(id: i64, permission: i64) -> Self {
        Self {
            id,
            username: format!("user{id}"),
            password: String::new(),
            token: format!("token{id}"),
            enabled: true,
            permission,
            timestamp: 0,
            registration: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct FileRow {
    pub id: i64,
    pub name: String,
    pub original: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub mimetype: String,
    pub size: i64,
    pub hash: String,
    pub ip: Option<String>,
    pub userid: Option<i64>,
    pub albumid: Option<i64>,
    pub timestamp: i64,
    pub expirydate: Option<i64>,
}

impl FileRow {
    /// The public identifier is the name minus its extension. Thumbnails and
    /// archives are keyed by it.
    pub fn identifier(&self) -> &str {
        self.name.split('.').next().unwrap_or(&self.name)
    }

    pub fn extension(&self) -> &str {
        match self.name.find('.') {
            Some(idx) => &self.name[idx..],
            None => "",
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Album {
    pub id: i64,
    pub name: String,
    pub identifier: String,
    pub userid: i64,
    pub enabled: bool,
    pub public: bool,
    pub download: bool,
    pub description: String,
    pub timestamp: i64,
    #[sqlx(rename = "editedAt")]
    #[serde(rename = "editedAt")]
    pub edited_at: i64,
    #[sqlx(rename = "zipGeneratedAt")]
    #[serde(rename = "zipGeneratedAt")]
    pub zip_generated_at: i64,
}

impl Album {
    /// A cached archive is reusable only when it was generated after the
    /// album's last edit.
    pub fn zip_is_fresh(&self) -> bool {
        self.zip_generated_at > self.edited_at
    }
}

// ─── API envelopes ────────────────────────────────────────────────────────────

/// One entry of an upload response. `repeated` is set when deduplication
/// matched an existing row instead of inserting a new one.
#[derive(Debug, Clone, Serialize)]
pub struct UploadedFile {
    pub name: String,
    pub url: String,
    pub original: String,
    #[serde(rename = "type")]
    pub mimetype: String,
    pub size: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expirydate: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub albumid: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeated: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct LoginBody {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordBody {
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyTokenBody {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct UrlUploadBody {
    pub urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct FinishChunksBody {
    pub files: Vec<FinishChunksEntry>,
}

#[derive(Debug, Deserialize)]
pub struct FinishChunksEntry {
    pub uuid: String,
    pub original: Option<String>,
    pub size: Option<i64>,
    pub filelength: Option<usize>,
    pub age: Option<f64>,
    pub albumid: Option<i64>,
    #[serde(rename = "type")]
    pub mimetype: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SingleDeleteBody {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct BulkDeleteBody {
    pub field: String,
    pub values: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct CreateAlbumBody {
    pub name: String,
    pub description: Option<String>,
    pub download: Option<bool>,
    pub public: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct EditAlbumBody {
    pub id: i64,
    pub name: Option<String>,
    pub description: Option<String>,
    pub download: Option<bool>,
    pub public: Option<bool>,
    /// Delete instead of edit; with `purge` the album's files go too.
    #[serde(default)]
    pub purge: bool,
}

#[derive(Debug, Deserialize)]
pub struct DeleteAlbumBody {
    pub id: i64,
    #[serde(default)]
    pub purge: bool,
}

#[derive(Debug, Deserialize)]
pub struct AddFilesBody {
    pub ids: Vec<i64>,
    pub albumid: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_strips_extension() {
        let file = FileRow {
            id: 1,
            name: "abcd1234.tar.gz".into(),
            original: "x.tar.gz".into(),
            mimetype: "application/gzip".into(),
            size: 1,
            hash: String::new(),
            ip: None,
            userid: None,
            albumid: None,
            timestamp: 0,
            expirydate: None,
        };
        assert_eq!(file.identifier(), "abcd1234");
        assert_eq!(file.extension(), ".tar.gz");
    }

    #[test]
    fn group_names_follow_rank_ladder() {
        let mut user = User {
            id: 1,
            username: "u".into(),
            password: String::new(),
            token: String::new(),
            enabled: true,
            permission: perms::USER,
            timestamp: 0,
            registration: 0,
        };
        assert_eq!(user.group_name(), "user");
        assert!(!user.is_moderator());
        user.permission = perms::MODERATOR;
        assert_eq!(user.group_name(), "moderator");
        user.permission = perms::SUPERADMIN;
        assert!(user.is_admin());
        assert_eq!(user.group_name(), "superadmin");
    }

    #[test]
    fn zip_freshness_requires_strictly_newer_generation() {
        let mut album = Album {
            id: 1,
            name: "a".into(),
            identifier: "abcdefgh".into(),
            userid: 1,
            enabled: true,
            public: true,
            download: true,
            description: String::new(),
            timestamp: 0,
            edited_at: 100,
            zip_generated_at: 100,
        };
        assert!(!album.zip_is_fresh());
        album.zip_generated_at = 101;
        assert!(album.zip_is_fresh());
    }
}
