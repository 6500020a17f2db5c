use crate::error;

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}

/// Split a Plan 9 style dial string into protocol and a tokio-ready address.
///
/// `tcp!host!port` becomes `("tcp", "host:port")`, `unix!path!suffix` becomes
/// `("unix", "path")`.
pub fn parse_proto(arg: &str) -> Option<(&str, String)> {
    let mut split = arg.split('!');
    let (proto, addr, port) = (split.next()?, split.next()?, split.next()?);
    if split.next().is_some() {
        return None;
    }

    match proto {
        "tcp" => Some((proto, format!("{}:{}", addr, port))),
        "unix" => Some((proto, addr.to_owned())),
        _ => None,
    }
}
