use std::fmt;

#[macro_export]
macro_rules! err {
    ($base:expr, context: $msg:literal) => {
        $crate::error::RmPermError::with_context($base, $msg.to_string())
    };
    ($base:expr, context: $fmtstr:literal, $($args:tt)*) => {
        $crate::error::RmPermError::with_context($base, format!($fmtstr, $($args)*))
    };
    ($msg:literal) => {
        $crate::error::RmPermError::new($msg)
    };
    ($fmtstr:literal, $($args:tt)*) => {
        $crate::error::RmPermError::new(&format!($fmtstr, $($args)*))
    };
}

#[macro_export]
macro_rules! fail {
    ($msg:literal) => {
        return Err($crate::error::RmPermError::new($msg))
    };
    ($fmtstr:literal, $($args:tt)*) => {
        return Err($crate::error::RmPermError::new(&format!($fmtstr, $($args)*)))
    };
}

/// Fatal error raised while reading, rewriting or writing a module.
///
/// Contexts are pushed innermost first, so a failure parsing a class read from a file inside a
/// module renders as `bad descriptor for Lfoo/Bar; of smali/foo/Bar.smali`.
#[derive(Debug, PartialEq, Eq)]
pub struct RmPermError
{
    msg: String,
    contexts: Vec<String>,
}

impl RmPermError
{
    pub fn new(msg: &str) -> Self
    {
        RmPermError {
            msg: msg.to_string(),
            contexts: Vec::new(),
        }
    }

    pub fn with_context(base: RmPermError, context: String) -> Self
    {
        let mut contexts = base.contexts;
        contexts.push(context);
        RmPermError { msg: base.msg, contexts }
    }

    pub fn message(&self) -> &str
    {
        &self.msg
    }
}

impl fmt::Display for RmPermError
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.msg)?;
        let mut connector = " for ";
        for context in &self.contexts
        {
            write!(f, "{}{}", connector, context)?;
            connector = " of ";
        }
        Ok(())
    }
}

impl std::error::Error for RmPermError {}

impl From<std::io::Error> for RmPermError
{
    fn from(e: std::io::Error) -> Self
    {
        RmPermError::new(&e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contexts_render_innermost_first() {
        let e = err!("Unknown type descriptor Q");
        let e = err!(e, context: "Lcom/example/Foo;");
        let e = err!(e, context: "{}", "smali/com/example/Foo.smali");
        assert_eq!(
            e.to_string(),
            "Unknown type descriptor Q for Lcom/example/Foo; of smali/com/example/Foo.smali"
        );
        assert_eq!(e.message(), "Unknown type descriptor Q");
    }

    #[test]
    fn fail_returns_early() {
        fn check(n: usize) -> Result<usize, RmPermError> {
            if n > 4 {
                fail!("Too many registers: {}", n);
            }
            Ok(n)
        }
        assert_eq!(check(2), Ok(2));
        assert_eq!(check(6).unwrap_err().to_string(), "Too many registers: 6");
    }
}
