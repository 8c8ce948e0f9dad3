//! Template helper functions
//!
//! Registered on the minijinja environment under the names the
//! templates use: `az_loop`, `hostname`, `is_not_empty` and
//! `check_reference`.

use minijinja::value::Value;
use minijinja::{Environment, Error, ErrorKind};
use nimbus_common::descriptor::ZoneDistribution;
use nimbus_common::zones::ZoneSpread;

pub fn register(env: &mut Environment<'_>) {
    env.add_function("az_loop", az_loop);
    env.add_function("hostname", hostname);
    env.add_function("is_not_empty", is_not_empty);
    env.add_function("check_reference", check_reference);
}

/// One record per target availability zone, carrying that zone's share
/// of the group's quantity and autoscaler bounds.
fn az_loop(
    azs: Vec<String>,
    distribution: Option<String>,
    quantity: u32,
    max_size: Option<u32>,
    min_size: Option<u32>,
) -> Result<Value, Error> {
    let dist = match distribution.as_deref() {
        None | Some("") | Some("balanced") => ZoneDistribution::Balanced,
        Some("unbalanced") => ZoneDistribution::Unbalanced,
        Some(other) => {
            return Err(Error::new(
                ErrorKind::InvalidOperation,
                format!("unknown zone distribution {other:?}"),
            ))
        }
    };
    let shares: Vec<_> = ZoneSpread::new(
        &azs,
        dist,
        quantity,
        min_size.unwrap_or(0),
        max_size.unwrap_or(0),
    )
    .collect();
    Ok(Value::from_serialize(&shares))
}

/// The host component of a URL, without scheme, path or port.
fn hostname(url: String) -> String {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(&url);
    let host = rest.split('/').next().unwrap_or_default();
    host.split(':').next().unwrap_or_default().to_string()
}

/// Truthiness guard for optional scalar fields.
fn is_not_empty(value: Value) -> bool {
    if value.is_undefined() || value.is_none() {
        return false;
    }
    match value.len() {
        Some(len) => len > 0,
        None => true,
    }
}

/// Guard for optional object references; undefined and null are absent.
fn check_reference(value: Value) -> bool {
    !value.is_undefined() && !value.is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use minijinja::context;

    fn env() -> Environment<'static> {
        let mut env = Environment::new();
        register(&mut env);
        env
    }

    fn render(template: &str, ctx: Value) -> String {
        let mut env = env();
        env.add_template("t", template).unwrap();
        env.get_template("t").unwrap().render(ctx).unwrap()
    }

    #[test]
    fn test_az_loop_unbalanced() {
        let out = render(
            "{% for z in az_loop(azs, 'unbalanced', 7, none, none) %}{{ z.az }}={{ z.quantity }} {% endfor %}",
            context! { azs => vec!["a", "b", "c"] },
        );
        assert_eq!(out, "a=3 b=2 c=2 ");
    }

    #[test]
    fn test_az_loop_balanced_defaults() {
        let out = render(
            "{% for z in az_loop(azs, none, 6, 9, 3) %}{{ z.quantity }}/{{ z.min_size }}/{{ z.max_size }} {% endfor %}",
            context! { azs => vec!["a", "b", "c"] },
        );
        assert_eq!(out, "2/1/3 2/1/3 2/1/3 ");
    }

    #[test]
    fn test_hostname() {
        let out = render(
            "{{ hostname('oci://registry.example.com:5000/keos/charts') }}",
            context! {},
        );
        assert_eq!(out, "registry.example.com");
        let bare = render("{{ hostname('registry.example.com/keos') }}", context! {});
        assert_eq!(bare, "registry.example.com");
    }

    #[test]
    fn test_is_not_empty() {
        let out = render(
            "{{ is_not_empty(a) }},{{ is_not_empty(b) }},{{ is_not_empty(c) }},{{ is_not_empty(d) }}",
            context! { a => "x", b => "", c => Value::from(()), d => vec!["y"] },
        );
        assert_eq!(out, "true,false,false,true");
    }

    #[test]
    fn test_check_reference_on_undefined() {
        let out = render("{{ check_reference(missing) }}", context! {});
        assert_eq!(out, "false");
    }
}
