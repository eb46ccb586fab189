use super::{Field, Migration, Operation};

pub const QUERY_TABLE: &str = "catalog_catalogquery";
pub const CATALOG_TABLE: &str = "catalog_enterprisecatalog";
pub const CONTENT_TABLE: &str = "catalog_contentmetadata";
/// Explicit join model removed by `0031`.
pub const JOIN_MODEL_TABLE: &str = "catalog_contentmetadatatoqueries";
/// Link table of the `ContentMetadata.catalog_queries` many-to-many field.
pub const ASSOCIATION_TABLE: &str = "catalog_contentmetadata_catalog_queries";

/// Registered migrations, in declaration order.
pub static MIGRATIONS: &[Migration] = &[
    Migration {
        app: "catalog",
        name: "0030_auto_20220207_1209",
        dependencies: &[],
        initial: true,
        operations: &[
            Operation::CreateModel { name: "CatalogQuery", table: QUERY_TABLE },
            Operation::CreateModel { name: "EnterpriseCatalog", table: CATALOG_TABLE },
            Operation::CreateModel { name: "ContentMetadata", table: CONTENT_TABLE },
            Operation::CreateModel { name: "ContentMetadataToQueries", table: JOIN_MODEL_TABLE },
            Operation::AddField {
                model: "contentmetadata",
                name: "catalog_query_mapping",
                field: Field::ManyToManyThrough {
                    to: "catalog.CatalogQuery",
                    through: "catalog.ContentMetadataToQueries",
                },
            },
        ],
        postgres: r#"
            CREATE TABLE catalog_catalogquery (
                id BIGSERIAL PRIMARY KEY,
                uuid UUID NOT NULL UNIQUE,
                content_filter JSONB NOT NULL DEFAULT '{}'::jsonb,
                title VARCHAR(255) NULL,
                created TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                modified TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE TABLE catalog_enterprisecatalog (
                uuid UUID PRIMARY KEY,
                title VARCHAR(255) NOT NULL,
                enterprise_uuid UUID NOT NULL,
                catalog_query_id BIGINT NULL REFERENCES catalog_catalogquery (id) ON DELETE SET NULL,
                created TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                modified TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE INDEX catalog_enterprisecatalog_catalog_query_id_idx
                ON catalog_enterprisecatalog (catalog_query_id);

            CREATE TABLE catalog_contentmetadata (
                id BIGSERIAL PRIMARY KEY,
                content_key VARCHAR(255) NOT NULL UNIQUE,
                content_type VARCHAR(255) NOT NULL,
                parent_content_key VARCHAR(255) NULL,
                json_metadata JSONB NULL,
                created TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                modified TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE INDEX catalog_contentmetadata_content_type_idx
                ON catalog_contentmetadata (content_type);

            CREATE TABLE catalog_contentmetadatatoqueries (
                id BIGSERIAL PRIMARY KEY,
                content_metadata_id BIGINT NOT NULL REFERENCES catalog_contentmetadata (id) ON DELETE CASCADE,
                catalog_query_id BIGINT NOT NULL REFERENCES catalog_catalogquery (id) ON DELETE CASCADE,
                UNIQUE (content_metadata_id, catalog_query_id)
            );
        "#,
    },
    Migration {
        app: "catalog",
        name: "0031_auto_20220512_1526",
        dependencies: &[("catalog", "0030_auto_20220207_1209")],
        initial: false,
        operations: &[
            Operation::RemoveField {
                model: "contentmetadata",
                name: "catalog_query_mapping",
            },
            Operation::AddField {
                model: "contentmetadata",
                name: "catalog_queries",
                field: Field::ManyToMany { to: "catalog.CatalogQuery" },
            },
            Operation::DeleteModel { name: "ContentMetadataToQueries" },
        ],
        // existing pairs are carried over before the join model is dropped
        postgres: r#"
            CREATE TABLE catalog_contentmetadata_catalog_queries (
                id BIGSERIAL PRIMARY KEY,
                contentmetadata_id BIGINT NOT NULL REFERENCES catalog_contentmetadata (id) ON DELETE CASCADE,
                catalogquery_id BIGINT NOT NULL REFERENCES catalog_catalogquery (id) ON DELETE CASCADE,
                UNIQUE (contentmetadata_id, catalogquery_id)
            );
            CREATE INDEX catalog_contentmetadata_catalog_queries_catalogquery_id_idx
                ON catalog_contentmetadata_catalog_queries (catalogquery_id);

            INSERT INTO catalog_contentmetadata_catalog_queries (contentmetadata_id, catalogquery_id)
            SELECT DISTINCT content_metadata_id, catalog_query_id
            FROM catalog_contentmetadatatoqueries;

            DROP TABLE catalog_contentmetadatatoqueries;
        "#,
    },
];
