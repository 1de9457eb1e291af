pub mod icons;
pub mod output;
pub mod progress;
pub mod table;
pub mod theme;

pub use icons::Icons;
pub use output::{header, info, section, status, success, warn};
pub use progress::{countdown, StageProgress};
pub use table::{breakpoint_table, stats_table, TableBuilder};
pub use theme::{theme, Theme};
