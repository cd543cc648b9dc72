//! v001 -- Initial schema creation.
//!
//! Creates the six core tables: `users`, `channels`, `messages`, `reactions`,
//! `sync_state`, and `query_specs`.  Nested collections (attachments,
//! members, reads, vote data) live in JSON TEXT columns; timestamps are
//! RFC-3339 TEXT.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id          TEXT PRIMARY KEY NOT NULL,
    name        TEXT NOT NULL DEFAULT '',
    image       TEXT NOT NULL DEFAULT '',
    role        TEXT NOT NULL DEFAULT '',
    created_at  TEXT,
    updated_at  TEXT,
    last_active TEXT,
    invisible   INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    banned      INTEGER NOT NULL DEFAULT 0,
    extra_data  TEXT NOT NULL DEFAULT '{}'   -- JSON object
);

-- ----------------------------------------------------------------
-- Channels
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS channels (
    cid             TEXT PRIMARY KEY NOT NULL, -- `type:id`
    channel_type    TEXT NOT NULL,
    channel_id      TEXT NOT NULL,
    name            TEXT NOT NULL DEFAULT '',
    image           TEXT NOT NULL DEFAULT '',
    created_by_id   TEXT NOT NULL DEFAULT '',
    created_at      TEXT,
    updated_at      TEXT,
    deleted_at      TEXT,
    last_message_at TEXT,
    members         TEXT NOT NULL DEFAULT '[]', -- JSON array of Member
    reads           TEXT NOT NULL DEFAULT '[]', -- JSON array of ChannelRead
    unread_count    INTEGER NOT NULL DEFAULT 0,
    config          TEXT NOT NULL DEFAULT '{}', -- JSON ChannelConfig
    sync_status     INTEGER NOT NULL,
    extra_data      TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_channels_sync_status ON channels(sync_status);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id                 TEXT PRIMARY KEY NOT NULL,
    cid                TEXT,                      -- nullable until assigned
    text               TEXT NOT NULL DEFAULT '',
    user_id            TEXT NOT NULL DEFAULT '',
    attachments        TEXT NOT NULL DEFAULT '[]', -- JSON array of Attachment
    sync_status        INTEGER NOT NULL,
    created_at         TEXT,
    created_locally_at TEXT,
    updated_at         TEXT,
    updated_locally_at TEXT,
    deleted_at         TEXT,
    own_reactions      TEXT NOT NULL DEFAULT '[]',
    reaction_counts    TEXT NOT NULL DEFAULT '{}',
    mentioned_user_ids TEXT NOT NULL DEFAULT '[]',
    parent_id          TEXT,
    reply_count        INTEGER NOT NULL DEFAULT 0,
    poll               TEXT,                      -- nullable JSON Poll
    extra_data         TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_messages_cid
    ON messages(cid, coalesce(created_at, created_locally_at));
CREATE INDEX IF NOT EXISTS idx_messages_sync_status ON messages(sync_status);
CREATE INDEX IF NOT EXISTS idx_messages_parent ON messages(parent_id);

-- ----------------------------------------------------------------
-- Reactions
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS reactions (
    message_id  TEXT NOT NULL,
    user_id     TEXT NOT NULL,
    kind        TEXT NOT NULL,
    score       INTEGER NOT NULL DEFAULT 1,
    sync_status INTEGER NOT NULL,
    created_at  TEXT,
    updated_at  TEXT,
    deleted_at  TEXT,
    extra_data  TEXT NOT NULL DEFAULT '{}',

    PRIMARY KEY (message_id, user_id, kind)
);

CREATE INDEX IF NOT EXISTS idx_reactions_sync_status ON reactions(sync_status);

-- ----------------------------------------------------------------
-- Sync state (one row per user)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS sync_state (
    user_id        TEXT PRIMARY KEY NOT NULL,
    active_cids    TEXT NOT NULL DEFAULT '[]', -- JSON array of cids
    last_synced_at TEXT
);

-- ----------------------------------------------------------------
-- Saved channel-list queries
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS query_specs (
    id     TEXT PRIMARY KEY NOT NULL, -- blake3 of (filter, sort)
    filter TEXT NOT NULL,
    sort   TEXT NOT NULL,
    cids   TEXT NOT NULL DEFAULT '[]'
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
