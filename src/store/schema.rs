//! Database schema constants for the PostgreSQL store backend.

/// Correlation entries, one row per callback id. The resolution is kept in
/// its own column so it can be set with a conditional update.
pub const CREATE_CALLBACK_CORRELATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS callback_correlations (
    callback_id VARCHAR(255) PRIMARY KEY,
    stage_key TEXT NOT NULL,
    phase VARCHAR(32) NOT NULL,
    entry JSONB NOT NULL,
    resolution JSONB,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    resolved_at TIMESTAMPTZ
)
"#;

/// Step outcomes, written once per step execution.
pub const CREATE_STEP_OUTCOMES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS step_outcomes (
    step_execution_id VARCHAR(255) PRIMARY KEY,
    outcome JSONB NOT NULL,
    completed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// Stage-scoped sweeping outputs.
pub const CREATE_SWEEPING_OUTPUTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS sweeping_outputs (
    stage_key TEXT NOT NULL,
    output_key VARCHAR(255) NOT NULL,
    scope JSONB NOT NULL,
    value TEXT NOT NULL,
    written_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (stage_key, output_key)
)
"#;

pub const CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_callback_correlations_stage ON callback_correlations(stage_key);
CREATE INDEX IF NOT EXISTS idx_callback_correlations_unresolved ON callback_correlations(created_at) WHERE resolution IS NULL
"#;

/// Responses delivered before their correlation entry was recorded.
pub const CREATE_HELD_DELIVERIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS held_deliveries (
    callback_id VARCHAR(255) PRIMARY KEY,
    response JSONB NOT NULL,
    held_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_held_deliveries_held_at ON held_deliveries(held_at);
CREATE INDEX IF NOT EXISTS idx_callback_correlations_resolved ON callback_correlations(resolved_at) WHERE resolved_at IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_step_outcomes_completed ON step_outcomes(completed_at)
"#;

/// All schema statements in creation order. Migration names are derived from
/// positions, so new statements are only ever appended.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_CALLBACK_CORRELATIONS_TABLE,
        CREATE_STEP_OUTCOMES_TABLE,
        CREATE_SWEEPING_OUTPUTS_TABLE,
        CREATE_INDEXES,
        CREATE_HELD_DELIVERIES_TABLE,
    ]
}

/// Table names in the schema.
pub mod tables {
    pub const CALLBACK_CORRELATIONS: &str = "callback_correlations";
    pub const STEP_OUTCOMES: &str = "step_outcomes";
    pub const SWEEPING_OUTPUTS: &str = "sweeping_outputs";
    pub const HELD_DELIVERIES: &str = "held_deliveries";
}
