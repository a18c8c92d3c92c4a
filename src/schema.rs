// Fixed tables. Event and series tables are declared at runtime from the
// entity graph and the series catalogue, see `Database::ensure_*`.

diesel::table! {
    generic_columns (id) {
        id -> Integer,
        entity -> Text,
        name -> Text,
        pretty_name -> Text,
        description -> Text,
        value_type -> Text,
        params_json -> Text,
        is_public -> Bool,
        created_at -> Text,
        last_computed -> Nullable<Text>,
    }
}

diesel::table! {
    generic_column_owners (column_id, user_id) {
        column_id -> Integer,
        user_id -> Integer,
    }
}

diesel::table! {
    changelog (id) {
        id -> Integer,
        author -> Integer,
        changed_at -> Text,
        entity -> Text,
        event_id -> BigInt,
        column_name -> Text,
        old_value -> Nullable<Text>,
        new_value -> Nullable<Text>,
    }
}

diesel::joinable!(generic_column_owners -> generic_columns (column_id));
diesel::allow_tables_to_appear_in_same_query!(generic_columns, generic_column_owners);
