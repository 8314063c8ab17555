//! Helper macro for declaring action types.

/// Binds concrete Goal/Result/Feedback message types and a name to an
/// [`Action`](crate::action::Action) implementor.
///
/// ```
/// use ros_act::define_action;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// pub struct FibonacciGoal {
///     pub order: i32,
/// }
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// pub struct FibonacciResult {
///     pub sequence: Vec<i32>,
/// }
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// pub struct FibonacciFeedback {
///     pub partial: Vec<i32>,
/// }
///
/// pub struct Fibonacci;
///
/// define_action! {
///     Fibonacci,
///     action_name: "/fibonacci",
///     Goal: FibonacciGoal,
///     Result: FibonacciResult,
///     Feedback: FibonacciFeedback,
/// }
/// ```
#[macro_export]
macro_rules! define_action {
    (
        $action_struct:ident,
        action_name: $action_name:expr,
        Goal: $goal_type:ty,
        Result: $result_type:ty,
        Feedback: $feedback_type:ty $(,)?
    ) => {
        impl $crate::action::Action for $action_struct {
            type Goal = $goal_type;
            type Result = $result_type;
            type Feedback = $feedback_type;

            fn name() -> &'static str {
                $action_name
            }
        }
    };
}
