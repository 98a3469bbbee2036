diesel::table! {
    users (id) {
        id -> Uuid,
        email -> Varchar,
        name -> Varchar,
        role -> Varchar,
        is_blocked -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    tickets (id) {
        id -> Uuid,
        ticket_number -> Int8,
        subject -> Varchar,
        status -> Varchar,
        priority -> Varchar,
        channel -> Varchar,
        ticket_type -> Varchar,
        requester_id -> Uuid,
        assignee_id -> Nullable<Uuid>,
        form_id -> Nullable<Uuid>,
        category -> Nullable<Varchar>,
        related_ticket_id -> Nullable<Uuid>,
        merged_into_id -> Nullable<Uuid>,
        problem_id -> Nullable<Uuid>,
        first_response_at -> Nullable<Timestamptz>,
        solved_at -> Nullable<Timestamptz>,
        closed_at -> Nullable<Timestamptz>,
        merged_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    ticket_comments (id) {
        id -> Uuid,
        ticket_id -> Uuid,
        author_id -> Uuid,
        body -> Text,
        body_plain -> Text,
        is_internal -> Bool,
        is_system -> Bool,
        channel -> Varchar,
        email_message_id -> Nullable<Varchar>,
        email_from -> Nullable<Varchar>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    ticket_activities (id) {
        id -> Uuid,
        ticket_id -> Uuid,
        actor_id -> Nullable<Uuid>,
        action -> Varchar,
        details -> Jsonb,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    email_threads (id) {
        id -> Uuid,
        ticket_id -> Uuid,
        reply_token -> Varchar,
        last_message_id -> Nullable<Varchar>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    backlog_snapshots (id) {
        id -> Uuid,
        snapshot_date -> Date,
        new_count -> Int4,
        open_count -> Int4,
        pending_count -> Int4,
        on_hold_count -> Int4,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    support_settings (id) {
        id -> Uuid,
        auto_solve_enabled -> Bool,
        auto_solve_hours -> Int4,
        auto_close_enabled -> Bool,
        auto_close_hours -> Int4,
        ai_drafts_enabled -> Bool,
        updated_at -> Timestamptz,
    }
}

diesel::joinable!(tickets -> users (requester_id));
diesel::joinable!(ticket_comments -> tickets (ticket_id));
diesel::joinable!(ticket_activities -> tickets (ticket_id));
diesel::joinable!(email_threads -> tickets (ticket_id));

diesel::allow_tables_to_appear_in_same_query!(
    users,
    tickets,
    ticket_comments,
    ticket_activities,
    email_threads,
    backlog_snapshots,
    support_settings,
);
