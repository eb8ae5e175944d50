// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators consumed by the
// synthetic trader decision engine. Every public function tolerates
// insufficient data by returning an empty series or `None`.

pub mod rsi;
pub mod sma;
