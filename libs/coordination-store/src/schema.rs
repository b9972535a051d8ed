//! Schema definition for the coordination store.
//!
//! Table prefixes are configurable per logical service, so the DDL is
//! rendered from templates rather than shipped as static migration files.
//! `{p}` expands to the infrastructure prefix (default `wh_`) and `{pp}` to
//! the perspective prefix (default `wh_per_`).
//!
//! The schema ships two helper functions and one stored procedure:
//!
//! - `{p}uuid_v7()`: time-ordered UUID generation inside the database.
//! - `{p}normalize_message_type(text)`: canonical `"Type, Assembly"` form
//!   with Version/Culture/PublicKeyToken tokens stripped; NULL when either
//!   part is missing, so un-normalizable names never match.
//! - `{p}process_work_batch(...)`: the single-transaction round of
//!   heartbeat, lease recovery, transition application, event persistence,
//!   perspective auto-creation and work claiming described in the crate
//!   docs.

/// Prefix configuration for one logical service's schema.
#[derive(Debug, Clone)]
pub struct SchemaConfig {
    /// Prefix for infrastructure tables, e.g. `wh_`.
    pub infra_prefix: String,
    /// Prefix for perspective tables, e.g. `wh_per_`.
    pub perspective_prefix: String,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            infra_prefix: "wh_".to_string(),
            perspective_prefix: "wh_per_".to_string(),
        }
    }
}

/// One named DDL statement. The name doubles as the migration-journal
/// checkpoint key.
#[derive(Debug, Clone)]
pub struct SchemaStatement {
    pub name: &'static str,
    pub sql: String,
}

impl SchemaConfig {
    pub fn with_prefix(infra_prefix: impl Into<String>) -> Self {
        let infra_prefix = infra_prefix.into();
        let perspective_prefix = format!("{}per_", infra_prefix);
        Self {
            infra_prefix,
            perspective_prefix,
        }
    }

    /// Fully-qualified name of an infrastructure table.
    pub fn table(&self, name: &str) -> String {
        format!("{}{}", self.infra_prefix, name)
    }

    /// Fully-qualified name of a perspective table.
    pub fn perspective_table(&self, name: &str) -> String {
        format!("{}{}", self.perspective_prefix, name)
    }

    /// Name of the batch function.
    pub fn batch_function(&self) -> String {
        self.table("process_work_batch")
    }

    fn render(&self, template: &str) -> String {
        template
            .replace("{pp}", &self.perspective_prefix)
            .replace("{p}", &self.infra_prefix)
    }

    /// The full ordered statement list. Applying them in order on an empty
    /// database (or re-applying on an existing one) yields the current
    /// schema.
    pub fn statements(&self) -> Vec<SchemaStatement> {
        STATEMENTS
            .iter()
            .map(|(name, template)| SchemaStatement {
                name,
                sql: self.render(template),
            })
            .collect()
    }
}

const STATEMENTS: &[(&str, &str)] = &[
    ("uuid_v7_function", UUID_V7_FUNCTION),
    ("normalize_message_type_function", NORMALIZE_FUNCTION),
    ("service_instances_table", SERVICE_INSTANCES_TABLE),
    ("outbox_table", OUTBOX_TABLE),
    ("outbox_work_index", OUTBOX_WORK_INDEX),
    ("inbox_table", INBOX_TABLE),
    ("inbox_work_index", INBOX_WORK_INDEX),
    ("event_sequence", EVENT_SEQUENCE),
    ("events_table", EVENTS_TABLE),
    ("events_metadata_index", EVENTS_METADATA_INDEX),
    ("message_associations_table", MESSAGE_ASSOCIATIONS_TABLE),
    ("perspective_checkpoints_table", PERSPECTIVE_CHECKPOINTS_TABLE),
    ("perspective_events_table", PERSPECTIVE_EVENTS_TABLE),
    ("perspective_events_work_index", PERSPECTIVE_EVENTS_WORK_INDEX),
    ("receptor_processing_table", RECEPTOR_PROCESSING_TABLE),
    ("dedup_table", DEDUP_TABLE),
    ("process_work_batch_function", PROCESS_WORK_BATCH_FUNCTION),
];

const UUID_V7_FUNCTION: &str = r#"
CREATE OR REPLACE FUNCTION {p}uuid_v7() RETURNS uuid
LANGUAGE plpgsql VOLATILE AS $fn$
DECLARE
    unix_ms bigint := (extract(epoch FROM clock_timestamp()) * 1000)::bigint;
    buf bytea := uuid_send(gen_random_uuid());
BEGIN
    buf := set_byte(buf, 0, ((unix_ms >> 40) & 255)::int);
    buf := set_byte(buf, 1, ((unix_ms >> 32) & 255)::int);
    buf := set_byte(buf, 2, ((unix_ms >> 24) & 255)::int);
    buf := set_byte(buf, 3, ((unix_ms >> 16) & 255)::int);
    buf := set_byte(buf, 4, ((unix_ms >> 8) & 255)::int);
    buf := set_byte(buf, 5, (unix_ms & 255)::int);
    buf := set_byte(buf, 6, 112 | (get_byte(buf, 6) & 15));
    buf := set_byte(buf, 8, 128 | (get_byte(buf, 8) & 63));
    RETURN encode(buf, 'hex')::uuid;
END;
$fn$
"#;

const NORMALIZE_FUNCTION: &str = r#"
CREATE OR REPLACE FUNCTION {p}normalize_message_type(p_type text) RETURNS text
LANGUAGE plpgsql IMMUTABLE AS $fn$
DECLARE
    parts text[];
    type_name text;
    assembly text := NULL;
    part text;
    i int;
BEGIN
    IF p_type IS NULL THEN
        RETURN NULL;
    END IF;
    parts := string_to_array(p_type, ',');
    IF array_length(parts, 1) IS NULL OR array_length(parts, 1) < 2 THEN
        RETURN NULL;
    END IF;
    type_name := btrim(parts[1]);
    FOR i IN 2..array_length(parts, 1) LOOP
        part := btrim(parts[i]);
        IF part = ''
            OR part ILIKE 'Version=%'
            OR part ILIKE 'Culture=%'
            OR part ILIKE 'PublicKeyToken=%' THEN
            CONTINUE;
        END IF;
        assembly := part;
        EXIT;
    END LOOP;
    IF type_name = '' OR assembly IS NULL THEN
        RETURN NULL;
    END IF;
    RETURN type_name || ', ' || assembly;
END;
$fn$
"#;

const SERVICE_INSTANCES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS {p}service_instances (
    instance_id    uuid PRIMARY KEY,
    service_name   text NOT NULL,
    host_name      text NOT NULL,
    process_id     int NOT NULL,
    metadata       jsonb,
    last_heartbeat timestamptz NOT NULL
)
"#;

const OUTBOX_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS {p}outbox (
    message_id       uuid PRIMARY KEY,
    destination      text NOT NULL,
    event_type       text NOT NULL,
    envelope_type    text NOT NULL,
    envelope         jsonb NOT NULL,
    metadata         jsonb NOT NULL DEFAULT '{}'::jsonb,
    stream_id        uuid NOT NULL,
    partition_number int NOT NULL DEFAULT 0,
    is_event         boolean NOT NULL DEFAULT false,
    status           int NOT NULL DEFAULT 0,
    attempts         int NOT NULL DEFAULT 0,
    last_error       text,
    instance_id      uuid,
    lease_expiry     timestamptz,
    created_at       timestamptz NOT NULL DEFAULT now()
)
"#;

const OUTBOX_WORK_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS {p}outbox_work_idx
    ON {p}outbox (status, lease_expiry, partition_number)
"#;

const INBOX_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS {p}inbox (
    message_id   uuid PRIMARY KEY,
    source       text NOT NULL,
    envelope     jsonb NOT NULL,
    stream_id    uuid NOT NULL,
    status       int NOT NULL DEFAULT 0,
    attempts     int NOT NULL DEFAULT 0,
    last_error   text,
    instance_id  uuid,
    lease_expiry timestamptz,
    received_at  timestamptz NOT NULL DEFAULT now()
)
"#;

const INBOX_WORK_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS {p}inbox_work_idx
    ON {p}inbox (status, lease_expiry)
"#;

const EVENT_SEQUENCE: &str = r#"
CREATE SEQUENCE IF NOT EXISTS {p}event_seq
"#;

const EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS {p}events (
    event_id        uuid PRIMARY KEY,
    stream_id       uuid NOT NULL,
    aggregate_type  text NOT NULL DEFAULT '',
    event_type      text NOT NULL,
    event_data      jsonb NOT NULL,
    metadata        jsonb NOT NULL DEFAULT '{}'::jsonb,
    scope           jsonb,
    sequence_number bigint NOT NULL DEFAULT nextval('{p}event_seq'),
    version         bigint NOT NULL,
    created_at      timestamptz NOT NULL DEFAULT now(),
    UNIQUE (stream_id, version)
)
"#;

const EVENTS_METADATA_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS {p}events_metadata_idx
    ON {p}events USING gin (metadata)
"#;

const MESSAGE_ASSOCIATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS {p}message_associations (
    message_type     text NOT NULL,
    association_type smallint NOT NULL,
    target_name      text NOT NULL,
    service_name     text NOT NULL,
    normalized_type  text,
    PRIMARY KEY (message_type, association_type, target_name)
)
"#;

const PERSPECTIVE_CHECKPOINTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS {pp}checkpoints (
    stream_id        uuid NOT NULL,
    perspective_name text NOT NULL,
    last_event_id    uuid,
    status           smallint NOT NULL DEFAULT 0,
    error            text,
    processed_at     timestamptz NOT NULL DEFAULT now(),
    PRIMARY KEY (stream_id, perspective_name)
)
"#;

const PERSPECTIVE_EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS {pp}events (
    event_work_id    uuid PRIMARY KEY,
    stream_id        uuid NOT NULL,
    perspective_name text NOT NULL,
    event_id         uuid NOT NULL,
    sequence_number  bigint NOT NULL,
    status           int NOT NULL DEFAULT 0,
    attempts         int NOT NULL DEFAULT 0,
    last_error       text,
    instance_id      uuid,
    lease_expiry     timestamptz,
    processed_at     timestamptz,
    created_at       timestamptz NOT NULL DEFAULT now(),
    UNIQUE (event_id, perspective_name)
)
"#;

const PERSPECTIVE_EVENTS_WORK_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS {pp}events_work_idx
    ON {pp}events (status, lease_expiry, stream_id, perspective_name, sequence_number)
"#;

const RECEPTOR_PROCESSING_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS {p}receptor_processing (
    event_id      uuid NOT NULL,
    receptor_name text NOT NULL,
    status        int NOT NULL DEFAULT 0,
    error         text,
    processed_at  timestamptz NOT NULL DEFAULT now(),
    PRIMARY KEY (event_id, receptor_name)
)
"#;

const DEDUP_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS {p}dedup (
    message_id    uuid PRIMARY KEY,
    first_seen_at timestamptz NOT NULL,
    source        text NOT NULL
)
"#;

const PROCESS_WORK_BATCH_FUNCTION: &str = r#"
CREATE OR REPLACE FUNCTION {p}process_work_batch(
    p_instance_id uuid,
    p_service_name text,
    p_host_name text,
    p_process_id int,
    p_instance_metadata jsonb,
    p_now timestamptz,
    p_lease_seconds int,
    p_partition_count int,
    p_partitions int[],
    p_batch_size int,
    p_new_messages jsonb,
    p_transitions jsonb
) RETURNS jsonb
LANGUAGE plpgsql AS $fn$
DECLARE
    v_expiry timestamptz := p_now + make_interval(secs => p_lease_seconds);
    v_new jsonb := '[]'::jsonb;
    v_outbox jsonb;
    v_inbox jsonb;
    v_perspective jsonb;
    v_version bigint;
    rec record;
    assoc record;
BEGIN
    -- 1. Heartbeat.
    INSERT INTO {p}service_instances (instance_id, service_name, host_name, process_id, metadata, last_heartbeat)
    VALUES (p_instance_id, p_service_name, p_host_name, p_process_id, p_instance_metadata, p_now)
    ON CONFLICT (instance_id) DO UPDATE
        SET service_name = excluded.service_name,
            host_name = excluded.host_name,
            process_id = excluded.process_id,
            metadata = excluded.metadata,
            last_heartbeat = excluded.last_heartbeat;

    -- 2. Lease recovery. Expired non-terminal claims return to the pool.
    UPDATE {p}outbox
    SET status = status & ~3, instance_id = NULL, lease_expiry = NULL
    WHERE lease_expiry IS NOT NULL AND lease_expiry < p_now AND status & 28 = 0;

    UPDATE {p}inbox
    SET status = status & ~1, instance_id = NULL, lease_expiry = NULL
    WHERE lease_expiry IS NOT NULL AND lease_expiry < p_now AND status & 6 = 0;

    UPDATE {pp}events
    SET status = status & ~3, instance_id = NULL, lease_expiry = NULL
    WHERE lease_expiry IS NOT NULL AND lease_expiry < p_now AND status & 28 = 0;

    -- 3. Persist outbox events into the event store. Runs before the
    -- reported completions are applied so a row completed this cycle is
    -- stored first; the completions clause also covers a row whose lease
    -- was taken over between publish and report.
    FOR rec IN
        SELECT o.message_id, o.stream_id, o.event_type, o.envelope, o.metadata
        FROM {p}outbox o
        WHERE o.is_event
          AND NOT EXISTS (SELECT 1 FROM {p}events e WHERE e.event_id = o.message_id)
          AND ((o.instance_id = p_instance_id AND o.status & 1 = 1)
               OR o.message_id IN (
                   SELECT t.id::uuid
                   FROM jsonb_array_elements_text(coalesce(p_transitions->'outbox_completions', '[]'::jsonb)) AS t(id)))
        ORDER BY o.created_at, o.message_id
    LOOP
        SELECT coalesce(max(version), 0) + 1 INTO v_version
        FROM {p}events WHERE stream_id = rec.stream_id;

        INSERT INTO {p}events (event_id, stream_id, aggregate_type, event_type, event_data,
                               metadata, scope, version, created_at)
        VALUES (rec.message_id,
                rec.stream_id,
                coalesce(rec.metadata->>'aggregate_type', ''),
                rec.event_type,
                coalesce(rec.envelope->'Payload', rec.envelope),
                rec.metadata,
                rec.metadata->'scope',
                v_version, p_now);

        v_new := v_new || jsonb_build_array(jsonb_build_object(
            'event_id', rec.message_id,
            'stream_id', rec.stream_id,
            'event_type', rec.event_type));
    END LOOP;

    -- 4. Apply reported completions and failures. Idempotent.
    UPDATE {p}outbox o
    SET status = (o.status | 4) & ~3, instance_id = NULL, lease_expiry = NULL
    FROM jsonb_array_elements_text(coalesce(p_transitions->'outbox_completions', '[]'::jsonb)) AS t(id)
    WHERE o.message_id = t.id::uuid;

    UPDATE {p}outbox o
    SET status = (o.status & ~3)
            | CASE WHEN coalesce((f.elem->>'poison')::boolean, false) THEN 16 ELSE 8 END,
        last_error = f.elem->>'error',
        instance_id = NULL,
        lease_expiry = NULL
    FROM jsonb_array_elements(coalesce(p_transitions->'outbox_failures', '[]'::jsonb)) AS f(elem)
    WHERE o.message_id = (f.elem->>'id')::uuid
      AND o.status & 4 = 0;

    UPDATE {p}inbox i
    SET status = (i.status | 2) & ~1, instance_id = NULL, lease_expiry = NULL
    FROM jsonb_array_elements_text(coalesce(p_transitions->'inbox_completions', '[]'::jsonb)) AS t(id)
    WHERE i.message_id = t.id::uuid;

    UPDATE {p}inbox i
    SET status = (i.status & ~1) | 4,
        last_error = f.elem->>'error',
        instance_id = NULL,
        lease_expiry = NULL
    FROM jsonb_array_elements(coalesce(p_transitions->'inbox_failures', '[]'::jsonb)) AS f(elem)
    WHERE i.message_id = (f.elem->>'id')::uuid
      AND i.status & 2 = 0;

    UPDATE {pp}events pe
    SET status = (pe.status | 4) & ~3, instance_id = NULL, lease_expiry = NULL, processed_at = p_now
    FROM jsonb_array_elements_text(coalesce(p_transitions->'perspective_event_completions', '[]'::jsonb)) AS t(id)
    WHERE pe.event_work_id = t.id::uuid;

    UPDATE {pp}events pe
    SET status = (pe.status & ~3)
            | CASE WHEN coalesce((f.elem->>'poison')::boolean, false) THEN 16 ELSE 8 END,
        last_error = f.elem->>'error',
        instance_id = NULL,
        lease_expiry = NULL
    FROM jsonb_array_elements(coalesce(p_transitions->'perspective_event_failures', '[]'::jsonb)) AS f(elem)
    WHERE pe.event_work_id = (f.elem->>'id')::uuid
      AND pe.status & 4 = 0;

    -- 4b. Insert new messages accumulated by the work coordinator.
    INSERT INTO {p}outbox (message_id, destination, event_type, envelope_type, envelope, metadata,
                           stream_id, partition_number, is_event, status, attempts, created_at)
    SELECT (m->>'message_id')::uuid,
           m->>'destination',
           m->>'event_type',
           m->>'envelope_type',
           m->'envelope',
           coalesce(m->'metadata', '{}'::jsonb),
           (m->>'stream_id')::uuid,
           coalesce((m->>'partition_number')::int, 0),
           coalesce((m->>'is_event')::boolean, false),
           0, 0, p_now
    FROM jsonb_array_elements(coalesce(p_new_messages->'outbox', '[]'::jsonb)) AS m
    ON CONFLICT (message_id) DO NOTHING;

    -- Inbox inserts consult the dedup ledger first; a message id seen before
    -- never produces a second inbox row. Entries carrying a companion event
    -- are persisted to the event store here and join the working set.
    FOR rec IN
        SELECT value AS m
        FROM jsonb_array_elements(coalesce(p_new_messages->'inbox', '[]'::jsonb))
    LOOP
        INSERT INTO {p}dedup (message_id, first_seen_at, source)
        VALUES ((rec.m->>'message_id')::uuid, p_now, rec.m->>'source')
        ON CONFLICT (message_id) DO NOTHING;
        IF NOT FOUND THEN
            CONTINUE;
        END IF;

        INSERT INTO {p}inbox (message_id, source, envelope, stream_id, status, attempts, received_at)
        VALUES ((rec.m->>'message_id')::uuid,
                rec.m->>'source',
                rec.m->'envelope',
                (rec.m->>'stream_id')::uuid,
                0, 0, p_now)
        ON CONFLICT (message_id) DO NOTHING;

        IF rec.m->'event' IS NOT NULL AND jsonb_typeof(rec.m->'event') = 'object'
           AND NOT EXISTS (SELECT 1 FROM {p}events e WHERE e.event_id = (rec.m->>'message_id')::uuid)
        THEN
            SELECT coalesce(max(version), 0) + 1 INTO v_version
            FROM {p}events WHERE stream_id = (rec.m->>'stream_id')::uuid;

            INSERT INTO {p}events (event_id, stream_id, aggregate_type, event_type, event_data,
                                   metadata, scope, version, created_at)
            VALUES ((rec.m->>'message_id')::uuid,
                    (rec.m->>'stream_id')::uuid,
                    coalesce(rec.m->'event'->>'aggregate_type', ''),
                    rec.m->'event'->>'event_type',
                    coalesce(rec.m->'event'->'event_data', 'null'::jsonb),
                    coalesce(rec.m->'event'->'metadata', '{}'::jsonb),
                    rec.m->'event'->'scope',
                    v_version, p_now);

            v_new := v_new || jsonb_build_array(jsonb_build_object(
                'event_id', rec.m->>'message_id',
                'stream_id', rec.m->>'stream_id',
                'event_type', rec.m->'event'->>'event_type'));
        END IF;
    END LOOP;

    -- 5. Auto-create perspective checkpoints and work items for the working
    -- set, using the fuzzy association lookup.
    FOR rec IN
        SELECT (e->>'event_id')::uuid AS event_id,
               (e->>'stream_id')::uuid AS stream_id,
               e->>'event_type' AS event_type
        FROM jsonb_array_elements(v_new) AS e
    LOOP
        FOR assoc IN
            SELECT a.target_name
            FROM {p}message_associations a
            WHERE a.association_type = 1
              AND a.normalized_type IS NOT NULL
              AND a.normalized_type = {p}normalize_message_type(rec.event_type)
        LOOP
            INSERT INTO {pp}checkpoints (stream_id, perspective_name, last_event_id, status, processed_at)
            VALUES (rec.stream_id, assoc.target_name, NULL, 0, p_now)
            ON CONFLICT (stream_id, perspective_name) DO NOTHING;

            INSERT INTO {pp}events (event_work_id, stream_id, perspective_name, event_id,
                                    sequence_number, status, attempts, created_at)
            SELECT {p}uuid_v7(), rec.stream_id, assoc.target_name, rec.event_id,
                   e.sequence_number, 0, 0, p_now
            FROM {p}events e
            WHERE e.event_id = rec.event_id
            ON CONFLICT (event_id, perspective_name) DO NOTHING;
        END LOOP;
    END LOOP;

    -- 6. Perspective-level completions advance checkpoints monotonically;
    -- failures record the error and fail-stop the pair.
    FOR rec IN
        SELECT value AS r
        FROM jsonb_array_elements(coalesce(p_transitions->'perspective_completions', '[]'::jsonb))
    LOOP
        UPDATE {pp}checkpoints c
        SET last_event_id = (rec.r->>'last_event_id')::uuid,
            status = 1,
            error = NULL,
            processed_at = p_now
        WHERE c.stream_id = (rec.r->>'stream_id')::uuid
          AND c.perspective_name = rec.r->>'perspective_name'
          AND coalesce((SELECT e.sequence_number FROM {p}events e
                        WHERE e.event_id = (rec.r->>'last_event_id')::uuid), 0)
              >= coalesce((SELECT e2.sequence_number FROM {p}events e2
                           WHERE e2.event_id = c.last_event_id), 0);
    END LOOP;

    FOR rec IN
        SELECT value AS r
        FROM jsonb_array_elements(coalesce(p_transitions->'perspective_failures', '[]'::jsonb))
    LOOP
        UPDATE {pp}checkpoints c
        SET status = 2,
            error = rec.r->>'error',
            processed_at = p_now
        WHERE c.stream_id = (rec.r->>'stream_id')::uuid
          AND c.perspective_name = rec.r->>'perspective_name';
    END LOOP;

    -- 7. Claim new work. SKIP LOCKED keeps concurrent callers from blocking
    -- each other.
    WITH candidates AS (
        SELECT o.message_id
        FROM {p}outbox o
        WHERE o.status & 29 = 0
          AND (o.lease_expiry IS NULL OR o.lease_expiry < p_now)
          AND (p_partitions IS NULL OR o.partition_number = ANY (p_partitions))
        ORDER BY o.created_at, o.message_id
        LIMIT p_batch_size
        FOR UPDATE SKIP LOCKED
    ), claimed AS (
        UPDATE {p}outbox o
        SET status = o.status | 3,
            instance_id = p_instance_id,
            lease_expiry = v_expiry,
            attempts = o.attempts + 1
        FROM candidates c
        WHERE o.message_id = c.message_id
        RETURNING o.*
    )
    SELECT coalesce(jsonb_agg(jsonb_build_object(
            'message_id', cl.message_id,
            'destination', cl.destination,
            'event_type', cl.event_type,
            'envelope_type', cl.envelope_type,
            'envelope', cl.envelope,
            'metadata', cl.metadata,
            'stream_id', cl.stream_id,
            'partition_number', cl.partition_number,
            'is_event', cl.is_event,
            'attempts', cl.attempts,
            'created_at', cl.created_at
        ) ORDER BY cl.created_at, cl.message_id), '[]'::jsonb)
    INTO v_outbox
    FROM claimed cl;

    WITH candidates AS (
        SELECT i.message_id
        FROM {p}inbox i
        WHERE i.status & 7 = 0
          AND (i.lease_expiry IS NULL OR i.lease_expiry < p_now)
        ORDER BY i.received_at, i.message_id
        LIMIT p_batch_size
        FOR UPDATE SKIP LOCKED
    ), claimed AS (
        UPDATE {p}inbox i
        SET status = i.status | 1,
            instance_id = p_instance_id,
            lease_expiry = v_expiry,
            attempts = i.attempts + 1
        FROM candidates c
        WHERE i.message_id = c.message_id
        RETURNING i.*
    )
    SELECT coalesce(jsonb_agg(jsonb_build_object(
            'message_id', cl.message_id,
            'source', cl.source,
            'envelope', cl.envelope,
            'stream_id', cl.stream_id,
            'attempts', cl.attempts,
            'received_at', cl.received_at
        ) ORDER BY cl.received_at, cl.message_id), '[]'::jsonb)
    INTO v_inbox
    FROM claimed cl;

    -- Perspective claims are restricted to the earliest pending event per
    -- (stream, perspective), to pairs with no outstanding claim, and to
    -- pairs whose checkpoint has not fail-stopped.
    WITH heads AS (
        SELECT h.event_work_id
        FROM (
            SELECT DISTINCT ON (pe.stream_id, pe.perspective_name) pe.event_work_id
            FROM {pp}events pe
            JOIN {pp}checkpoints c
              ON c.stream_id = pe.stream_id AND c.perspective_name = pe.perspective_name
            WHERE pe.status & 29 = 0
              AND (pe.lease_expiry IS NULL OR pe.lease_expiry < p_now)
              AND c.status & 6 = 0
              AND NOT EXISTS (
                  SELECT 1 FROM {pp}events x
                  WHERE x.stream_id = pe.stream_id
                    AND x.perspective_name = pe.perspective_name
                    AND x.status & 1 = 1
                    AND x.lease_expiry >= p_now
              )
              AND NOT EXISTS (
                  SELECT 1 FROM {pp}events y
                  WHERE y.stream_id = pe.stream_id
                    AND y.perspective_name = pe.perspective_name
                    AND y.sequence_number < pe.sequence_number
                    AND y.status & 4 = 0
              )
            ORDER BY pe.stream_id, pe.perspective_name, pe.sequence_number
        ) h
        LIMIT p_batch_size
    ), locked AS (
        SELECT pe.event_work_id
        FROM {pp}events pe
        JOIN heads h ON h.event_work_id = pe.event_work_id
        FOR UPDATE OF pe SKIP LOCKED
    ), claimed AS (
        UPDATE {pp}events pe
        SET status = pe.status | 3,
            instance_id = p_instance_id,
            lease_expiry = v_expiry,
            attempts = pe.attempts + 1
        FROM locked l
        WHERE pe.event_work_id = l.event_work_id
        RETURNING pe.*
    )
    SELECT coalesce(jsonb_agg(jsonb_build_object(
            'event_work_id', cl.event_work_id,
            'stream_id', cl.stream_id,
            'perspective_name', cl.perspective_name,
            'event_id', cl.event_id,
            'sequence_number', cl.sequence_number,
            'attempts', cl.attempts,
            'event_type', e.event_type,
            'event_data', e.event_data,
            'metadata', e.metadata,
            'version', e.version
        ) ORDER BY cl.sequence_number), '[]'::jsonb)
    INTO v_perspective
    FROM claimed cl
    JOIN {p}events e ON e.event_id = cl.event_id;

    -- 8. Return the ordered work lists.
    RETURN jsonb_build_object(
        'outbox_work', coalesce(v_outbox, '[]'::jsonb),
        'inbox_work', coalesce(v_inbox, '[]'::jsonb),
        'perspective_work', coalesce(v_perspective, '[]'::jsonb));
END;
$fn$
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_prefixes_follow_convention() {
        let config = SchemaConfig::default();
        assert_eq!(config.table("outbox"), "wh_outbox");
        assert_eq!(config.perspective_table("checkpoints"), "wh_per_checkpoints");
        assert_eq!(config.batch_function(), "wh_process_work_batch");
    }

    #[test]
    fn with_prefix_derives_perspective_prefix() {
        let config = SchemaConfig::with_prefix("billing_");
        assert_eq!(config.table("events"), "billing_events");
        assert_eq!(config.perspective_table("events"), "billing_per_events");
    }

    #[test]
    fn statements_render_without_leftover_placeholders() {
        let config = SchemaConfig::default();
        for statement in config.statements() {
            assert!(
                !statement.sql.contains("{p}") && !statement.sql.contains("{pp}"),
                "unrendered placeholder in {}",
                statement.name
            );
        }
    }

    #[test]
    fn statement_names_are_unique() {
        let config = SchemaConfig::default();
        let statements = config.statements();
        let mut names: Vec<_> = statements.iter().map(|s| s.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), statements.len());
    }

    #[test]
    fn batch_function_touches_every_work_table() {
        let config = SchemaConfig::default();
        let batch = config
            .statements()
            .into_iter()
            .find(|s| s.name == "process_work_batch_function")
            .unwrap();
        for table in [
            "wh_service_instances",
            "wh_outbox",
            "wh_inbox",
            "wh_events",
            "wh_message_associations",
            "wh_per_checkpoints",
            "wh_per_events",
            "wh_dedup",
        ] {
            assert!(batch.sql.contains(table), "missing {}", table);
        }
        assert!(batch.sql.contains("FOR UPDATE SKIP LOCKED"));
    }
}
