/// Configuration macros
///
/// `config_struct!` declares a config section with its defaults inline. Each
/// field is written as `name: Type = default`, and the macro generates the
/// struct, its `Default` impl and serde support with `#[serde(default)]`, so
/// a partial TOML section only overrides the keys it names.
///
/// # Example
/// ```ignore
/// config_struct! {
///     pub struct BusConfig {
///         subscription_buffer: usize = 64,
///         strict_channels: bool = false,
///     }
/// }
/// ```
#[macro_export]
macro_rules! config_struct {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$field_meta:meta])*
                $field_name:ident: $field_type:ty = $default_value:expr
            ),*
            $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
        #[serde(default)]
        $vis struct $name {
            $(
                $(#[$field_meta])*
                pub $field_name: $field_type,
            )*
        }

        impl Default for $name {
            fn default() -> Self {
                Self {
                    $(
                        $field_name: $default_value,
                    )*
                }
            }
        }
    };
}
