//! Gadget-reduction and layout-correctness passes (components C2-C7, plus
//! the layout-side PromoteJumps fixup and the non-gadget-reduction
//! ancillary modes). See DESIGN.md for which file under
//! `original_source/src/pass/` each one is grounded on.

pub mod ancillary;
pub mod function_reordering;
pub mod merge_jump;
pub mod merge_return;
pub mod offset_sledding;
pub mod promote_jumps;
pub mod sanitize_volatiles;
pub mod widen_barriers;

pub use function_reordering::FunctionReorderingProfile;
pub use offset_sledding::OffsetSleddingProfile;
