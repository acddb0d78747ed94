mod rewind;
mod tracked;

pub(crate) use self::rewind::Rewind;
pub(crate) use self::tracked::Tracked;
