//! Construction macros.

/// Builds a [`Document`](crate::Document) from `key => value` pairs.
///
/// Values go through `Into<Value>`, so literals, strings, nested `doc!`
/// invocations, and `Vec`s of convertible values all work directly.
///
/// ```
/// use vellum_bson::doc;
///
/// let command = doc! {
///     "find" => "users",
///     "filter" => doc! { "active" => true },
///     "limit" => 10,
/// };
/// assert_eq!(command.get_i32("limit"), Some(10));
/// ```
#[macro_export]
macro_rules! doc {
    () => {
        $crate::Document::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut doc = $crate::Document::new();
        $(
            doc.insert($key, $value);
        )+
        doc
    }};
}
