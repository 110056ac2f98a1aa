/// Builds a [`ServiceDescriptor`](crate::ServiceDescriptor).
///
/// Method indices follow declaration order.
///
/// ```
/// use rpcrelay::{service, Type};
///
/// let user = Type::record([("id", Type::Int), ("name", Type::String)]);
/// let descriptor = service!("UserService" @ 1 {
///     "getUserByUserId"(Type::Int) -> user.clone();
///     "insertUserId"(user) -> Type::Int;
/// });
/// assert_eq!(descriptor.method_index("insertUserId"), Ok(1));
/// ```
#[macro_export]
macro_rules! service {
    ($name:literal @ $version:literal { $( $method:literal ( $($param:expr),* $(,)? ) -> $ret:expr ; )* }) => {
        $crate::ServiceDescriptor::new(
            $crate::ServiceId::new($name, $version),
            vec![
                $( $crate::MethodDescriptor::new($method, vec![$($param),*], $ret) ),*
            ],
        )
    };
}
