use actix_web::{test, web, App};
use chrono::DateTime;
use roomhub_server::websocket::{Client, ClientInfo};
use roomhub_server::{configure_routes, AppState, Hub, Settings};

#[actix_web::test]
async fn test_health_check() {
    let config = Settings::new_for_test().expect("Failed to load test config");
    let hub = Hub::spawn();
    let (client, _rx) = Client::new(ClientInfo::new(7, "alice", 3), 8);
    hub.register(client);
    hub.flush().await;

    let state = web::Data::new(AppState::new(config, hub));
    let app = test::init_service(
        App::new()
            .app_data(state.clone())
            .configure(configure_routes)
    ).await;

    let req = test::TestRequest::get().uri("/health").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let body = test::read_body(resp).await;
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(json["status"], "healthy");
    assert_eq!(json["rooms"], 1);
    assert_eq!(json["clients"], 1);
    assert!(DateTime::parse_from_rfc3339(
        json["timestamp"].as_str().unwrap()
    ).is_ok());
}
