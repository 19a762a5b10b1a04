diesel::table! {
    cvr_instances (client_group_id) {
        client_group_id -> Text,
        version -> Text,
        last_active -> Timestamp,
    }
}

diesel::table! {
    cvr_clients (client_group_id, client_id) {
        client_group_id -> Text,
        client_id -> Text,
        patch_version -> Text,
        desired_query_ids -> Array<Text>,
        deleted -> Bool,
    }
}

diesel::table! {
    cvr_queries (client_group_id, query_hash) {
        client_group_id -> Text,
        query_hash -> Text,
        ast -> Nullable<Jsonb>,
        internal -> Bool,
        desired_by -> Jsonb,
        transformation_hash -> Nullable<Text>,
        transformation_version -> Nullable<Text>,
        patch_version -> Nullable<Text>,
        deleted -> Bool,
    }
}

diesel::table! {
    cvr_rows (client_group_id, row_schema, row_table, row_key_text) {
        client_group_id -> Text,
        row_schema -> Text,
        row_table -> Text,
        row_key_text -> Text,
        row_key -> Jsonb,
        row_version -> Text,
        patch_version -> Text,
        ref_counts -> Nullable<Jsonb>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(cvr_instances, cvr_clients, cvr_queries, cvr_rows,);
