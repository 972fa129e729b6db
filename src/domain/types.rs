use serde::{Deserialize, Serialize};

/// MCard profile page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mcard {
  pub id: String,
  pub user_id: String,
  pub slug: String,
  pub full_name: String,
  #[serde(default)]
  pub job_title: Option<String>,
  #[serde(default)]
  pub company: Option<String>,
  #[serde(default)]
  pub plan: Option<String>, // "free", "essential" or "premium"
  #[serde(default)]
  pub is_published: bool,
  #[serde(default)]
  pub created_at: Option<String>,
  #[serde(default)]
  pub updated_at: Option<String>,
}

/// Status line an owner pins to their MCard ("Back in 5 min")
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McardStatus {
  pub id: String,
  pub mcard_id: String,
  pub status_text: String,
  #[serde(default)]
  pub status_color: Option<String>,
  #[serde(default)]
  pub is_active: bool,
  #[serde(default)]
  pub expires_at: Option<String>,
  #[serde(default)]
  pub created_at: Option<String>,
  #[serde(default)]
  pub updated_at: Option<String>,
}

/// Storefront item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McardProduct {
  pub id: String,
  pub mcard_id: String,
  pub name: String,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub price: Option<f64>,
  #[serde(default)]
  pub currency: Option<String>,
  #[serde(default)]
  pub image_url: Option<String>,
  #[serde(default)]
  pub is_active: bool,
  #[serde(default)]
  pub updated_at: Option<String>,
}

/// Visitor review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McardReview {
  pub id: String,
  pub mcard_id: String,
  pub reviewer_name: String,
  pub rating: i32,
  #[serde(default)]
  pub comment: Option<String>,
  #[serde(default)]
  pub is_approved: bool,
  #[serde(default)]
  pub created_at: Option<String>,
  #[serde(default)]
  pub updated_at: Option<String>,
}

/// Identity document someone reported as found
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportedCard {
  pub id: String,
  pub card_number: String,
  pub document_type: String,
  #[serde(default)]
  pub found_location: Option<String>,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub reporter_id: Option<String>,
  #[serde(default)]
  pub status: Option<String>, // "pending", "recovered", ...
  #[serde(default)]
  pub created_at: Option<String>,
  #[serde(default)]
  pub updated_at: Option<String>,
}

/// Identity document registered by its owner for loss alerts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCard {
  pub id: String,
  pub user_id: String,
  pub card_number: String,
  pub card_type: String,
  #[serde(default)]
  pub card_holder_name: Option<String>,
  #[serde(default)]
  pub is_active: bool,
  #[serde(default)]
  pub updated_at: Option<String>,
}
