//! Pipeline stages, one submodule per transformation step.
//!
//! Each stage owns exactly one output table and only reads upstream tables
//! plus the read-only lookup context. Keeping stages separate makes each
//! independently testable and lets us swap a prompting strategy without
//! touching agreement or balance logic elsewhere.
//!
//! ## Data Flow
//!
//! ```text
//! supplier ──▶ verify ──▶ vat ──▶ classify ──▶ normalize ──▶ reconcile
//! (resolve)   (gate)    (lines)  (ensemble)    (codes)       (diff)
//! ```
//!
//! 1. [`supplier`]  — map invoice text to at most one supplier record
//! 2. [`verify`]    — re-examine the prediction against header/footer; a
//!    binary trust gate, not a score
//! 3. [`vat`]       — decompose the invoice into per-VAT-type net lines
//!    with a gross/net balance check
//! 4. [`classify`]  — N independent oracle runs reduced by unanimity-only
//!    consensus into account/department per line
//! 5. [`normalize`] — rewrite legacy numeric account codes to canonical ids
//! 6. [`reconcile`] — group predicted and actual postings into aligned,
//!    diffable projections

pub mod classify;
pub mod normalize;
pub mod reconcile;
pub mod supplier;
pub mod vat;
pub mod verify;
