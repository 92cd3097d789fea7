use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // One row per checked-out book; files are stored as a JSON array
        manager
            .create_table(
                Table::create()
                    .table(BookDownloads::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(BookDownloads::BookId)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(BookDownloads::Status).string().not_null())
                    .col(ColumnDef::new(BookDownloads::Files).json().not_null())
                    .col(ColumnDef::new(BookDownloads::Error).string())
                    .col(
                        ColumnDef::new(BookDownloads::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_book_downloads_status")
                    .table(BookDownloads::Table)
                    .col(BookDownloads::Status)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        // Chunking parameters per URL, independent of book records
        manager
            .create_table(
                Table::create()
                    .table(ChunkedUrls::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ChunkedUrls::Url)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ChunkedUrls::Chunked)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(ChunkedUrls::ChunkSize)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ChunkedUrls::BytesTotal)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(ChunkedUrls::ContentType).string())
                    .col(
                        ColumnDef::new(ChunkedUrls::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ChunkedUrls::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(BookDownloads::Table).to_owned())
            .await?;

        Ok(())
    }
}

#[derive(Iden)]
enum BookDownloads {
    Table,
    BookId,
    Status,
    Files,
    Error,
    UpdatedAt,
}

#[derive(Iden)]
enum ChunkedUrls {
    Table,
    Url,
    Chunked,
    ChunkSize,
    BytesTotal,
    ContentType,
    UpdatedAt,
}
