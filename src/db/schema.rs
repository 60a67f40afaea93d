pub const SCHEMA: &str = r#"
-- Clusters of similar images. `hash` is the founding image's hash.
CREATE TABLE IF NOT EXISTS image_groups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    hash TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE,
    bytes INTEGER NOT NULL,
    hash TEXT NOT NULL,
    processed INTEGER NOT NULL DEFAULT 0,
    group_id INTEGER REFERENCES image_groups(id)
);

CREATE INDEX IF NOT EXISTS idx_images_unclaimed ON images(processed, group_id);
CREATE INDEX IF NOT EXISTS idx_images_group ON images(group_id);
"#;

pub const DROP_SCHEMA: &str = r#"
DROP TABLE IF EXISTS images;
DROP TABLE IF EXISTS image_groups;
"#;
