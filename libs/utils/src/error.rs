/// Formats an error with its sources on a single line, `outer: inner: innermost`,
/// the same way `anyhow` does with `{:#}`.
pub fn report_compact_sources<E: std::error::Error>(e: &E) -> impl std::fmt::Display + '_ {
    struct AnyErrorChain<'a, E>(&'a E);

    impl<E: std::error::Error> std::fmt::Display for AnyErrorChain<'_, E> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            std::fmt::Display::fmt(&self.0, f)?;

            let sources = std::iter::successors(self.0.source(), |e| (*e).source());
            for source in sources {
                write!(f, ": {source}")?;
            }

            Ok(())
        }
    }

    AnyErrorChain(e)
}
