pub mod glossary_loader;

pub use glossary_loader::{
    load_term_sheet, parse_reference, DirectoryLoader, GlossaryData, GlossaryLoader,
};
