use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240601_000001_create_products_table::Migration),
            Box::new(m20240601_000002_create_checkout_tables::Migration),
            Box::new(m20240601_000003_create_payment_events_table::Migration),
            Box::new(m20240601_000004_create_orders_and_entitlements::Migration),
            Box::new(m20240601_000005_create_ledger_counters::Migration),
        ]
    }
}

mod m20240601_000001_create_products_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000001_create_products_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            // Read-only projection of the catalog
            manager
                .create_table(
                    Table::create()
                        .table(Products::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Products::ProductId)
                                .string()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(Products::SellerId).string().not_null())
                        .col(ColumnDef::new(Products::Title).string().not_null())
                        .col(
                            ColumnDef::new(Products::PriceMinorUnits)
                                .big_integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Products::Currency).string_len(3).not_null())
                        .col(
                            ColumnDef::new(Products::Available)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(Products::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Products::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_products_seller_id")
                        .table(Products::Table)
                        .col(Products::SellerId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Products::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Products {
        Table,
        ProductId,
        SellerId,
        Title,
        PriceMinorUnits,
        Currency,
        Available,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240601_000002_create_checkout_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000002_create_checkout_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(CheckoutSessions::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(CheckoutSessions::Id)
                                .uuid()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(CheckoutSessions::BuyerId).string().not_null())
                        .col(
                            ColumnDef::new(CheckoutSessions::TotalMinorUnits)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CheckoutSessions::Currency)
                                .string_len(3)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CheckoutSessions::Status)
                                .string_len(32)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CheckoutSessions::GatewayAuthorizationId)
                                .string()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(CheckoutSessions::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CheckoutSessions::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_checkout_sessions_status_created_at")
                        .table(CheckoutSessions::Table)
                        .col(CheckoutSessions::Status)
                        .col(CheckoutSessions::CreatedAt)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(CheckoutSessionItems::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(CheckoutSessionItems::CheckoutSessionId)
                                .uuid()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CheckoutSessionItems::ProductId)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CheckoutSessionItems::SellerId)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CheckoutSessionItems::UnitPriceMinorUnits)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CheckoutSessionItems::Position)
                                .integer()
                                .not_null(),
                        )
                        .primary_key(
                            Index::create()
                                .col(CheckoutSessionItems::CheckoutSessionId)
                                .col(CheckoutSessionItems::ProductId),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_checkout_session_items_session")
                                .from(
                                    CheckoutSessionItems::Table,
                                    CheckoutSessionItems::CheckoutSessionId,
                                )
                                .to(CheckoutSessions::Table, CheckoutSessions::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(CheckoutSessionItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(CheckoutSessions::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum CheckoutSessions {
        Table,
        Id,
        BuyerId,
        TotalMinorUnits,
        Currency,
        Status,
        GatewayAuthorizationId,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum CheckoutSessionItems {
        Table,
        CheckoutSessionId,
        ProductId,
        SellerId,
        UnitPriceMinorUnits,
        Position,
    }
}

mod m20240601_000003_create_payment_events_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000003_create_payment_events_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            // Dedup table: one row per gateway event id
            manager
                .create_table(
                    Table::create()
                        .table(PaymentEvents::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(PaymentEvents::GatewayEventId)
                                .string()
                                .not_null()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(PaymentEvents::CheckoutSessionId)
                                .uuid()
                                .not_null(),
                        )
                        .col(ColumnDef::new(PaymentEvents::Outcome).string_len(16).not_null())
                        .col(ColumnDef::new(PaymentEvents::Status).string_len(16).not_null())
                        .col(
                            ColumnDef::new(PaymentEvents::Attempts)
                                .integer()
                                .not_null()
                                .default(1),
                        )
                        .col(
                            ColumnDef::new(PaymentEvents::LeaseExpiresAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PaymentEvents::ReceivedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentEvents::CompletedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payment_events_session_status")
                        .table(PaymentEvents::Table)
                        .col(PaymentEvents::CheckoutSessionId)
                        .col(PaymentEvents::Status)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(PaymentEvents::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum PaymentEvents {
        Table,
        GatewayEventId,
        CheckoutSessionId,
        Outcome,
        Status,
        Attempts,
        LeaseExpiresAt,
        ReceivedAt,
        CompletedAt,
    }
}

mod m20240601_000004_create_orders_and_entitlements {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000004_create_orders_and_entitlements"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Orders::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Orders::Id).uuid().not_null().primary_key())
                        .col(ColumnDef::new(Orders::CheckoutSessionId).uuid().not_null())
                        .col(ColumnDef::new(Orders::ProductId).string().not_null())
                        .col(ColumnDef::new(Orders::BuyerId).string().not_null())
                        .col(ColumnDef::new(Orders::SellerId).string().not_null())
                        .col(
                            ColumnDef::new(Orders::AmountMinorUnits)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::SellerEarningsMinorUnits)
                                .big_integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Orders::Currency).string_len(3).not_null())
                        .col(ColumnDef::new(Orders::Status).string_len(16).not_null())
                        .col(
                            ColumnDef::new(Orders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::RefundedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await?;

            // Materialization key: at most one order per cart line
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .unique()
                        .name("uq_orders_session_product")
                        .table(Orders::Table)
                        .col(Orders::CheckoutSessionId)
                        .col(Orders::ProductId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_buyer_created_at")
                        .table(Orders::Table)
                        .col(Orders::BuyerId)
                        .col(Orders::CreatedAt)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Entitlements::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Entitlements::BuyerId).string().not_null())
                        .col(ColumnDef::new(Entitlements::ProductId).string().not_null())
                        .col(ColumnDef::new(Entitlements::OrderId).uuid().not_null())
                        .col(
                            ColumnDef::new(Entitlements::GrantedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .primary_key(
                            Index::create()
                                .col(Entitlements::BuyerId)
                                .col(Entitlements::ProductId),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Entitlements::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Orders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Orders {
        Table,
        Id,
        CheckoutSessionId,
        ProductId,
        BuyerId,
        SellerId,
        AmountMinorUnits,
        SellerEarningsMinorUnits,
        Currency,
        Status,
        CreatedAt,
        RefundedAt,
    }

    #[derive(DeriveIden)]
    enum Entitlements {
        Table,
        BuyerId,
        ProductId,
        OrderId,
        GrantedAt,
    }
}

mod m20240601_000005_create_ledger_counters {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000005_create_ledger_counters"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(SellerLedgers::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(SellerLedgers::SellerId)
                                .string()
                                .not_null()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(SellerLedgers::SalesCount)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(SellerLedgers::EarningsMinorUnits)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(SellerLedgers::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(ProductLedgers::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(ProductLedgers::ProductId)
                                .string()
                                .not_null()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(ProductLedgers::SalesCount)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(ProductLedgers::RevenueMinorUnits)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(ProductLedgers::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(ProductLedgers::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(SellerLedgers::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum SellerLedgers {
        Table,
        SellerId,
        SalesCount,
        EarningsMinorUnits,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum ProductLedgers {
        Table,
        ProductId,
        SalesCount,
        RevenueMinorUnits,
        UpdatedAt,
    }
}
