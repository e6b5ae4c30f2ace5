mod admin;
mod attachments;
mod download;

pub use admin::{admin_purge, health};
pub use attachments::{
    create_attachment, delete_attachment, get_attachment, list_attachments, move_attachment,
    rename_attachment, revalidate_attachment,
};
pub use download::serve_content;
