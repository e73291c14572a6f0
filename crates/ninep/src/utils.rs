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

/// Split a dial string into its protocol and connect address.
///
/// `tcp!host!port` and `unix!path` are understood.
pub fn parse_proto(arg: &str) -> Option<(&str, String)> {
    let mut split = arg.split('!');
    let proto = split.next()?;

    match proto {
        "tcp" => {
            let (addr, port) = (split.next()?, split.next()?);
            Some((proto, format!("{}:{}", addr, port)))
        }
        "unix" => Some((proto, split.next()?.to_owned())),
        _ => None,
    }
}
