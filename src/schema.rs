// Diesel table definitions for the tables this crate owns directly (Persisted
// State Layout). Relational schema migrations beyond these tables are out of
// scope; see migrations/ for the matching DDL.

diesel::table! {
    integrations (integration_id) {
        integration_id -> Uuid,
        tenant_id -> Uuid,
        provider -> Text,
        credentials -> Bytea,
        settings -> Jsonb,
        custom_field_mappings -> Jsonb,
        active -> Bool,
    }
}

diesel::table! {
    etl_jobs (job_id) {
        job_id -> Uuid,
        tenant_id -> Uuid,
        integration_id -> Uuid,
        job_name -> Text,
        active -> Bool,
        schedule_interval_seconds -> Int8,
        next_run -> Timestamptz,
        overall_status -> Text,
        steps -> Jsonb,
        retry_count -> Int4,
        last_run_started -> Nullable<Timestamptz>,
        last_run_finished -> Nullable<Timestamptz>,
        last_sync_watermark -> Jsonb,
        error_message -> Nullable<Text>,
    }
}

diesel::table! {
    raw_extraction_data (raw_id) {
        raw_id -> Int8,
        tenant_id -> Uuid,
        integration_id -> Uuid,
        entity_type -> Text,
        external_id -> Nullable<Text>,
        payload -> Jsonb,
        metadata -> Jsonb,
        processing_status -> Text,
        created_at -> Timestamptz,
        processed_at -> Nullable<Timestamptz>,
        error_message -> Nullable<Text>,
    }
}

diesel::table! {
    work_items (external_id, tenant_id) {
        external_id -> Text,
        tenant_id -> Uuid,
        integration_id -> Uuid,
        key -> Text,
        summary -> Text,
        description -> Nullable<Text>,
        status -> Text,
        assignee -> Nullable<Text>,
        priority -> Nullable<Text>,
        issue_type -> Nullable<Text>,
        project -> Nullable<Text>,
        custom_field_01 -> Nullable<Text>,
        custom_field_02 -> Nullable<Text>,
        custom_field_03 -> Nullable<Text>,
        custom_field_04 -> Nullable<Text>,
        custom_field_05 -> Nullable<Text>,
        custom_field_06 -> Nullable<Text>,
        custom_field_07 -> Nullable<Text>,
        custom_field_08 -> Nullable<Text>,
        custom_field_09 -> Nullable<Text>,
        custom_field_10 -> Nullable<Text>,
        custom_field_11 -> Nullable<Text>,
        custom_field_12 -> Nullable<Text>,
        custom_field_13 -> Nullable<Text>,
        custom_field_14 -> Nullable<Text>,
        custom_field_15 -> Nullable<Text>,
        custom_field_16 -> Nullable<Text>,
        custom_field_17 -> Nullable<Text>,
        custom_field_18 -> Nullable<Text>,
        custom_field_19 -> Nullable<Text>,
        custom_field_20 -> Nullable<Text>,
        custom_fields_overflow -> Jsonb,
        created_at -> Timestamptz,
        last_updated_at -> Timestamptz,
    }
}

diesel::table! {
    projects (external_id, tenant_id) {
        external_id -> Text,
        tenant_id -> Uuid,
        integration_id -> Uuid,
        name -> Text,
        created_at -> Timestamptz,
        last_updated_at -> Timestamptz,
    }
}

diesel::table! {
    prs (external_id, tenant_id) {
        external_id -> Text,
        tenant_id -> Uuid,
        integration_id -> Uuid,
        title -> Text,
        state -> Text,
        author -> Nullable<Text>,
        repo -> Text,
        created_at -> Timestamptz,
        last_updated_at -> Timestamptz,
    }
}

diesel::table! {
    commits (external_id, tenant_id) {
        external_id -> Text,
        tenant_id -> Uuid,
        integration_id -> Uuid,
        parent_external_id -> Nullable<Text>,
        message -> Text,
        author -> Nullable<Text>,
        created_at -> Timestamptz,
        last_updated_at -> Timestamptz,
    }
}

diesel::table! {
    reviews (external_id, tenant_id) {
        external_id -> Text,
        tenant_id -> Uuid,
        integration_id -> Uuid,
        parent_external_id -> Nullable<Text>,
        state -> Text,
        author -> Nullable<Text>,
        created_at -> Timestamptz,
        last_updated_at -> Timestamptz,
    }
}

diesel::table! {
    comments (external_id, tenant_id) {
        external_id -> Text,
        tenant_id -> Uuid,
        integration_id -> Uuid,
        parent_external_id -> Nullable<Text>,
        body -> Text,
        author -> Nullable<Text>,
        created_at -> Timestamptz,
        last_updated_at -> Timestamptz,
    }
}

diesel::table! {
    custom_field_catalog (tenant_id, project_external_id, source_field_id) {
        tenant_id -> Uuid,
        project_external_id -> Text,
        source_field_id -> Text,
        display_name -> Text,
        first_seen_at -> Timestamptz,
        last_seen_at -> Timestamptz,
        active -> Bool,
    }
}

diesel::table! {
    issue_type_catalog (tenant_id, project_external_id, issue_type_id) {
        tenant_id -> Uuid,
        project_external_id -> Text,
        issue_type_id -> Text,
        display_name -> Text,
        first_seen_at -> Timestamptz,
        last_seen_at -> Timestamptz,
        active -> Bool,
    }
}

diesel::table! {
    vector_records (tenant_id, collection, external_id) {
        tenant_id -> Uuid,
        collection -> Text,
        external_id -> Text,
        embedding -> Array<Float8>,
        updated_at -> Timestamptz,
    }
}
