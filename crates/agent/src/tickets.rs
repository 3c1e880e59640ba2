use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Subcommand;

use keystone_core::{ExistenceChecker, Ticket, TicketStore};

use crate::output::{print_json, render_tickets};

#[derive(Subcommand)]
pub enum TicketsSubcommand {
    /// List stored tickets
    List,
    /// Register a product, replacing any ticket for the same product id
    Add {
        product_id: String,
        /// Installed version
        #[arg(long)]
        version: String,
        /// Update server URL
        #[arg(long)]
        server_url: String,
        /// Installed if this path exists
        #[arg(long, conflicts_with_all = ["desktop_entry", "search_query"])]
        path: Option<PathBuf>,
        /// Installed if this desktop entry is registered
        #[arg(long, conflicts_with = "search_query")]
        desktop_entry: Option<String>,
        /// Installed if the file search index finds this query
        #[arg(long)]
        search_query: Option<String>,
    },
    /// Remove the ticket for a product
    Remove { product_id: String },
}

pub async fn run(store: &dyn TicketStore, subcmd: TicketsSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        TicketsSubcommand::List => list(store, json).await,
        TicketsSubcommand::Add {
            product_id,
            version,
            server_url,
            path,
            desktop_entry,
            search_query,
        } => {
            let checker = existence_checker(path, desktop_entry, search_query);
            add(store, &product_id, &version, &server_url, checker, json)
        }
        TicketsSubcommand::Remove { product_id } => remove(store, &product_id, json),
    }
}

fn existence_checker(
    path: Option<PathBuf>,
    desktop_entry: Option<String>,
    search_query: Option<String>,
) -> ExistenceChecker {
    match (path, desktop_entry, search_query) {
        (Some(path), _, _) => ExistenceChecker::Path { path },
        (None, Some(app_id), _) => ExistenceChecker::DesktopEntry { app_id },
        (None, None, Some(query)) => ExistenceChecker::SearchIndex { query },
        (None, None, None) => ExistenceChecker::Never,
    }
}

async fn list(store: &dyn TicketStore, json: bool) -> anyhow::Result<()> {
    let tickets = store.tickets().context("Failed to read tickets")?;
    if json {
        return print_json(&tickets);
    }
    let mut listed = Vec::with_capacity(tickets.len());
    for ticket in tickets {
        let installed = ticket.is_installed().await;
        listed.push((ticket, installed));
    }
    println!("{}", render_tickets(&listed));
    Ok(())
}

fn add(
    store: &dyn TicketStore,
    product_id: &str,
    version: &str,
    server_url: &str,
    checker: ExistenceChecker,
    json: bool,
) -> anyhow::Result<()> {
    if checker == ExistenceChecker::Never {
        bail!("One of --path, --desktop-entry or --search-query is required");
    }
    let ticket = Ticket::new(product_id, version, checker, server_url).context("Invalid ticket")?;
    store.store_ticket(&ticket).context("Failed to store ticket")?;
    if json {
        print_json(&ticket)
    } else {
        println!("Stored ticket for {}", ticket.product_id());
        Ok(())
    }
}

fn remove(store: &dyn TicketStore, product_id: &str, json: bool) -> anyhow::Result<()> {
    let removed = store
        .delete_ticket_for_product_id(product_id)
        .context("Failed to delete ticket")?;
    if json {
        return print_json(&serde_json::json!({ "product_id": product_id, "removed": removed }));
    }
    if removed {
        println!("Removed ticket for {}", product_id);
    } else {
        println!("No ticket for {}", product_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_core::SqliteTicketStore;

    #[test]
    fn test_existence_checker_precedence() {
        assert_eq!(
            existence_checker(Some(PathBuf::from("/opt/app")), None, None),
            ExistenceChecker::path("/opt/app")
        );
        assert_eq!(
            existence_checker(None, Some("org.example.App".to_string()), None),
            ExistenceChecker::DesktopEntry {
                app_id: "org.example.App".to_string()
            }
        );
        assert_eq!(existence_checker(None, None, None), ExistenceChecker::Never);
    }

    #[test]
    fn test_add_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteTicketStore::new(&dir.path().join("Keystone.ticketstore")).unwrap();

        add(
            &store,
            "com.example.app",
            "1.0",
            "https://x.example.com/check",
            ExistenceChecker::path("/"),
            false,
        )
        .unwrap();
        assert_eq!(store.ticket_count().unwrap(), 1);

        remove(&store, "COM.EXAMPLE.APP", false).unwrap();
        assert_eq!(store.ticket_count().unwrap(), 0);
    }

    #[test]
    fn test_add_requires_checker() {
        let store = SqliteTicketStore::in_memory().unwrap();
        let result = add(
            &store,
            "com.example.app",
            "1.0",
            "https://x.example.com/check",
            ExistenceChecker::Never,
            false,
        );
        assert!(result.is_err());
        assert_eq!(store.ticket_count().unwrap(), 0);
    }
}
