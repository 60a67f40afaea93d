pub const POSTGRES_SCHEMA: &str = r#"
-- levenshtein(text, text)
CREATE EXTENSION IF NOT EXISTS fuzzystrmatch;

CREATE TABLE IF NOT EXISTS image_groups (
    id BIGSERIAL PRIMARY KEY,
    hash VARCHAR(255) NOT NULL
);

CREATE TABLE IF NOT EXISTS images (
    id BIGSERIAL PRIMARY KEY,
    path TEXT NOT NULL UNIQUE,
    bytes BIGINT NOT NULL,
    hash VARCHAR(255) NOT NULL,
    processed BOOLEAN NOT NULL DEFAULT FALSE,
    group_id BIGINT REFERENCES image_groups(id)
);

CREATE INDEX IF NOT EXISTS idx_images_unclaimed ON images(processed, group_id);
CREATE INDEX IF NOT EXISTS idx_images_group ON images(group_id);
"#;

pub const POSTGRES_DROP_SCHEMA: &str = r#"
DROP TABLE IF EXISTS images;
DROP TABLE IF EXISTS image_groups;
"#;
