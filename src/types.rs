use std::sync::Arc;

/// Type alias for a JIT-compiled function that evaluates multiple expressions at once.
///
/// This represents a function that:
/// - Takes a slice of input values laid out as `[y..., p...]`
/// - Takes a mutable slice to store the results
/// - Evaluates every expression and writes its result into the output slice
/// - Is both Send and Sync for thread safety
pub type CombinedJITFunction = Arc<dyn Fn(&[f64], &mut [f64]) + Send + Sync>;
